// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A growable, header-prefixed sequence backed by a single mapped view.

mod storage;

pub(crate) use storage::MappedStorage;

use crate::mapping::{AccessMode, OpenPolicy};
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytemuck::Pod;
use std::marker::PhantomData;
use std::path::Path;

/// Bytes reserved in front of the elements: user metadata plus the
/// persisted element count. One page, so the first element starts
/// page-aligned.
pub const HEADER_SIZE: usize = 4096;

const SIZE_FIELD_OFFSET: usize = HEADER_SIZE - std::mem::size_of::<u64>();

/// What happens to freshly exposed slots on growth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Leave new slots with indeterminate contents.
    NoInit,
    /// Explicitly zero-fill new slots. The mapping's own zero-fill
    /// behaviour is not relied upon.
    Zeroed,
}

/// A dynamic array of `T` living inside a memory-mapped region.
///
/// The first [`HEADER_SIZE`] bytes of the view hold user metadata and the
/// persisted element count; elements follow contiguously. `T` must be
/// [`Pod`]: relocation is a byte copy and any persisted bit pattern is a
/// valid value.
///
/// When backed by a file, the element count survives process lifetimes;
/// opening the same file restores the vector.
pub struct VmVector<T: Pod> {
    storage: MappedStorage,
    _marker: PhantomData<T>,
}

impl<T: Pod> Default for VmVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pod> VmVector<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            storage: MappedStorage::detached(),
            _marker: PhantomData,
        }
    }

    /// Maps the file at `path` per `policy`, read-write.
    ///
    /// A fresh file starts with a zeroed header and no elements; for an
    /// existing file the stored element count is clamped to what the file
    /// size can actually hold.
    pub fn open(path: &Path, policy: OpenPolicy) -> Result<Self> {
        Self::open_with_access(path, policy, AccessMode::ReadWrite)
    }

    /// Maps the file at `path` with an explicit access mode. Read-only
    /// vectors refuse every growing or mutating operation.
    pub fn open_with_access(
        path: &Path,
        policy: OpenPolicy,
        access: AccessMode,
    ) -> Result<Self> {
        let (mut storage, created) = MappedStorage::open(path, policy, access, HEADER_SIZE)?;

        if created {
            storage.as_mut_slice()[..HEADER_SIZE].fill(0);
        }

        let mut this = Self {
            storage,
            _marker: PhantomData,
        };

        let stored = this.stored_len();
        let clamped = stored.min(this.capacity() as u64);
        if stored != clamped {
            log::warn!("clamping persisted element count {stored} to {clamped}");
            if !this.is_read_only() {
                this.set_stored_len(clamped);
            }
        }

        Ok(this)
    }

    /// Creates an anonymous, process-private vector with room for
    /// `initial_capacity` elements.
    pub fn map_memory(initial_capacity: usize) -> Result<Self> {
        let storage = MappedStorage::map_memory(Self::byte_size(initial_capacity))?;
        let mut this = Self {
            storage,
            _marker: PhantomData,
        };
        this.storage.as_mut_slice()[..HEADER_SIZE].fill(0);
        Ok(this)
    }

    #[must_use]
    pub fn has_attached_storage(&self) -> bool {
        self.storage.has_storage()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.storage.is_read_only()
    }

    fn byte_size(elements: usize) -> usize {
        HEADER_SIZE + elements * std::mem::size_of::<T>()
    }

    fn stored_len(&self) -> u64 {
        LittleEndian::read_u64(&self.storage.as_slice()[SIZE_FIELD_OFFSET..HEADER_SIZE])
    }

    fn set_stored_len(&mut self, len: u64) {
        LittleEndian::write_u64(
            &mut self.storage.as_mut_slice()[SIZE_FIELD_OFFSET..HEADER_SIZE],
            len,
        );
    }

    /// Number of live elements. A persisted count the file can no longer
    /// hold (truncated backing) is clamped rather than trusted.
    #[must_use]
    pub fn len(&self) -> usize {
        if !self.has_attached_storage() {
            return 0;
        }
        self.stored_len().min(self.capacity() as u64) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements the current mapping can hold without growing.
    #[must_use]
    pub fn capacity(&self) -> usize {
        if !self.has_attached_storage() {
            return 0;
        }
        (self.storage.mapped_size() - HEADER_SIZE) / std::mem::size_of::<T>()
    }

    /// The header bytes reserved for the caller's own metadata.
    #[must_use]
    pub fn user_header(&self) -> &[u8] {
        &self.storage.as_slice()[..SIZE_FIELD_OFFSET]
    }

    /// Mutable access to the caller's header metadata area.
    #[must_use]
    pub fn user_header_mut(&mut self) -> &mut [u8] {
        &mut self.storage.as_mut_slice()[..SIZE_FIELD_OFFSET]
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        let len = self.len();
        if len == 0 {
            return &[];
        }
        bytemuck::cast_slice(&self.storage.as_slice()[HEADER_SIZE..Self::byte_size(len)])
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len();
        if len == 0 {
            return &mut [];
        }
        bytemuck::cast_slice_mut(&mut self.storage.as_mut_slice()[HEADER_SIZE..Self::byte_size(len)])
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    #[must_use]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    /// Base pointer of the element area. Invalidated by any growing call.
    #[must_use]
    pub fn data(&self) -> *mut u8 {
        debug_assert!(self.has_attached_storage());
        // SAFETY: the header page always precedes the elements
        unsafe { self.storage.data().add(HEADER_SIZE) }
    }

    /// Ensures capacity for at least `additional` more elements without
    /// changing `len`.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let wanted = self.len() + additional;
        if wanted > self.capacity() {
            self.storage.expand(Self::byte_size(wanted))?;
        }
        Ok(())
    }

    /// Grows the vector to exactly `new_len` elements.
    pub fn grow_to(&mut self, new_len: usize, policy: GrowthPolicy) -> Result<()> {
        let len = self.len();
        debug_assert!(new_len >= len);

        if new_len > self.capacity() {
            self.storage.expand(Self::byte_size(new_len))?;
        }
        self.set_stored_len(new_len as u64);

        if policy == GrowthPolicy::Zeroed && new_len > len {
            let bytes = &mut self.storage.as_mut_slice()[Self::byte_size(len)..Self::byte_size(new_len)];
            bytes.fill(0);
        }

        Ok(())
    }

    /// Appends `n` elements.
    pub fn grow_by(&mut self, n: usize, policy: GrowthPolicy) -> Result<()> {
        self.grow_to(self.len() + n, policy)
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        let len = self.len();
        self.grow_to(len + 1, GrowthPolicy::NoInit)?;
        self.as_mut_slice()[len] = value;
        Ok(())
    }

    /// Inserts `value` at `index`, shifting later elements up.
    pub fn insert(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.len();
        assert!(index <= len);
        self.grow_to(len + 1, GrowthPolicy::NoInit)?;
        let slice = self.as_mut_slice();
        slice.copy_within(index..len, index + 1);
        slice[index] = value;
        Ok(())
    }

    /// Removes and returns the element at `index`, shifting later elements
    /// down.
    pub fn remove(&mut self, index: usize) -> T {
        let len = self.len();
        assert!(index < len);
        let slice = self.as_mut_slice();
        let value = slice[index];
        slice.copy_within(index + 1..len, index);
        self.set_stored_len(len as u64 - 1);
        value
    }

    /// Grows or truncates to exactly `new_len` elements.
    pub fn resize(&mut self, new_len: usize, policy: GrowthPolicy) -> Result<()> {
        if new_len >= self.len() {
            self.grow_to(new_len, policy)
        } else {
            self.set_stored_len(new_len as u64);
            Ok(())
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let value = self.as_slice()[len - 1];
        self.set_stored_len(len as u64 - 1);
        Some(value)
    }

    /// Drops all elements; capacity is kept.
    pub fn clear(&mut self) {
        if self.has_attached_storage() && !self.is_read_only() {
            self.set_stored_len(0);
        }
    }

    /// Gives the capacity slack back to the OS / the backing file.
    pub fn shrink_to_fit(&mut self) {
        if self.has_attached_storage() {
            let len = self.len();
            self.storage.shrink(Self::byte_size(len));
        }
    }

    /// Schedules dirty pages for writeback.
    pub fn flush_async(&self) -> Result<()> {
        self.storage.flush_async()
    }

    /// Flushes to durable storage and waits for completion.
    pub fn flush_blocking(&self) -> Result<()> {
        self.storage.flush_blocking()
    }

    /// Unmaps the storage; a file backing keeps its contents.
    pub fn detach(&mut self) {
        self.storage.detach();
    }

    pub(crate) fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.storage, &mut other.storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn anonymous_push_pop() {
        let mut v = VmVector::<u64>::map_memory(0).expect("map");
        assert!(v.is_empty());
        assert_eq!(v.capacity(), 0);

        for i in 0..10_000u64 {
            v.push(i * 3).expect("push");
        }
        assert_eq!(v.len(), 10_000);
        assert_eq!(v.as_slice()[1234], 1234 * 3);

        assert_eq!(v.pop(), Some(9999 * 3));
        assert_eq!(v.len(), 9999);
    }

    #[test]
    fn growth_policies() {
        let mut v = VmVector::<u32>::map_memory(4).expect("map");
        v.grow_by(4, GrowthPolicy::Zeroed).expect("grow");
        assert_eq!(v.as_slice(), &[0, 0, 0, 0]);

        v.as_mut_slice()[0] = 7;
        v.grow_by(1, GrowthPolicy::NoInit).expect("grow");
        assert_eq!(v.as_slice()[0], 7);
        assert_eq!(v.len(), 5);
    }

    #[test]
    fn insert_remove_shift_elements() {
        let mut v = VmVector::<u32>::map_memory(8).expect("map");
        for i in [1u32, 2, 4, 5] {
            v.push(i).expect("push");
        }

        v.insert(2, 3).expect("insert");
        assert_eq!(v.as_slice(), &[1, 2, 3, 4, 5]);

        assert_eq!(v.remove(0), 1);
        assert_eq!(v.as_slice(), &[2, 3, 4, 5]);

        v.resize(2, GrowthPolicy::NoInit).expect("resize");
        assert_eq!(v.as_slice(), &[2, 3]);
        v.resize(4, GrowthPolicy::Zeroed).expect("resize");
        assert_eq!(v.as_slice(), &[2, 3, 0, 0]);
    }

    #[test]
    fn reserve_keeps_len() {
        let mut v = VmVector::<u8>::map_memory(0).expect("map");
        v.reserve(1 << 16).expect("reserve");
        assert!(v.is_empty());
        assert!(v.capacity() >= 1 << 16);
    }

    #[test]
    fn user_header_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vec");

        {
            let mut v = VmVector::<u32>::open(&path, OpenPolicy::CreateNew).expect("create");
            v.user_header_mut()[..4].copy_from_slice(b"meta");
            for i in 0..1000 {
                v.push(i).expect("push");
            }
            v.flush_blocking().expect("flush");
        }

        let v = VmVector::<u32>::open(&path, OpenPolicy::OpenExisting).expect("reopen");
        assert_eq!(&v.user_header()[..4], b"meta");
        assert_eq!(v.len(), 1000);
        assert_eq!(v.as_slice()[999], 999);
    }

    #[test]
    fn persisted_len_is_clamped_to_file_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vec");

        {
            let mut v = VmVector::<u64>::open(&path, OpenPolicy::CreateNew).expect("create");
            for i in 0..100u64 {
                v.push(i).expect("push");
            }
            v.flush_blocking().expect("flush");
        }

        // truncate away most of the elements but keep the stale size field
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("open raw");
        file.set_len((HEADER_SIZE + 10 * std::mem::size_of::<u64>()) as u64)
            .expect("truncate");
        drop(file);

        let v = VmVector::<u64>::open(&path, OpenPolicy::OpenExisting).expect("reopen");
        assert_eq!(v.len(), 10);
        assert_eq!(v.as_slice()[9], 9);
    }

    #[test]
    fn read_only_open_answers_queries_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vec");

        {
            let mut v = VmVector::<u32>::open(&path, OpenPolicy::CreateNew).expect("create");
            v.push(11).expect("push");
            v.flush_blocking().expect("flush");
        }

        let mut v =
            VmVector::<u32>::open_with_access(&path, OpenPolicy::OpenExisting, AccessMode::Read)
                .expect("reopen");
        assert_eq!(v.len(), 1);
        assert_eq!(v.as_slice()[0], 11);
        assert!(matches!(v.reserve(100), Err(crate::Error::ReadOnly)));
    }
}
