// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{AccessMode, Mapping};
use crate::vm::{self, align_down, align_up, AllocType, RelocType};
use crate::{Error, Result};
use std::ptr::NonNull;

/// An owned span over a mapped region.
///
/// The view reports exactly the requested size; the kernel-rounded extent
/// may be larger and is accounted for internally. An empty view owns
/// nothing.
pub struct MappedView {
    ptr: *mut u8,
    len: usize,
    file_backed: bool,
    read_only: bool,
}

impl Default for MappedView {
    fn default() -> Self {
        Self::empty()
    }
}

impl MappedView {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
            file_backed: false,
            read_only: false,
        }
    }

    /// Maps `desired_size` bytes of `mapping` starting at `offset`.
    ///
    /// `desired_size` must be non-zero and `offset` aligned to the reserve
    /// granularity.
    pub fn map(mapping: &Mapping, offset: u64, desired_size: usize) -> Result<Self> {
        debug_assert!(desired_size > 0);
        debug_assert!(offset % vm::reserve_granularity() as u64 == 0);

        let read_only = !mapping.access().is_writable();

        if let Some(file) = mapping.file() {
            let ptr = sys::map_file(file, mapping.access(), offset, desired_size)?;
            Ok(Self {
                ptr: ptr.as_ptr(),
                len: desired_size,
                file_backed: true,
                read_only,
            })
        } else {
            debug_assert_eq!(offset, 0);
            let span = vm::allocate(desired_size).ok_or(Error::OutOfMemory)?;
            Ok(Self {
                ptr: span.as_mut_ptr(),
                len: desired_size,
                file_backed: false,
                read_only,
            })
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn data(&self) -> *mut u8 {
        debug_assert!(!self.is_empty(), "no storage attached");
        self.ptr
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        if self.is_empty() {
            &[]
        } else {
            // SAFETY: the view owns ptr..ptr+len
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert!(!self.read_only);
        if self.is_empty() {
            &mut []
        } else {
            // SAFETY: the view owns ptr..ptr+len exclusively
            unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
        }
    }

    /// The extent the kernel actually granted.
    fn kernel_extent(&self) -> usize {
        align_up(self.len, vm::reserve_granularity())
    }

    /// Enlarges the view to cover `target` bytes of the same mapping.
    ///
    /// For file backings the file must already have been grown. Growth may
    /// relocate the span; callers rebind any derived pointers.
    pub fn expand(&mut self, target: usize, mapping: &Mapping) -> Result<()> {
        debug_assert!(target >= self.len);

        // 1. the kernel extent may already suffice
        if self.kernel_extent() >= target {
            self.len = target;
            return Ok(());
        }

        if self.is_empty() {
            *self = Self::map(mapping, 0, target)?;
            return Ok(());
        }

        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let current_extent = self.kernel_extent();
        let base = NonNull::new(self.ptr).ok_or(Error::OutOfMemory)?;

        if self.file_backed {
            // 2. grow the existing file view in place where the host allows
            if let Some(ptr) = sys::grow_file_view(mapping, base, current_extent, target)? {
                if ptr.as_ptr() != self.ptr {
                    log::trace!("view expand relocated {current_extent} -> {target} B");
                }
                self.ptr = ptr.as_ptr();
                self.len = target;
                return Ok(());
            }

            // 3. fresh mapping of the full required size, then drop the old
            // view (the file keeps the contents)
            let fresh = Self::map(mapping, 0, target)?;
            debug_assert!(
                same_prefix(fresh.ptr, self.ptr, self.len),
                "view expansion garbled data"
            );
            *self = fresh;
            Ok(())
        } else {
            let rounded = align_up(target, vm::reserve_granularity());
            // SAFETY: the span is a live owned anonymous region
            let expansion = unsafe {
                vm::expand(
                    base,
                    current_extent,
                    rounded,
                    0,
                    self.len,
                    AllocType::Commit,
                    RelocType::Moveable,
                )
            }
            .ok_or(Error::OutOfMemory)?;

            self.ptr = expansion.span.as_mut_ptr();
            self.len = target;
            Ok(())
        }
    }

    /// Reduces the logical span to `target` bytes, returning whole pages of
    /// the tail where the host supports partial unmapping.
    pub fn shrink(&mut self, target: usize) {
        debug_assert!(target <= self.len);

        let commit = vm::commit_granularity();
        let tail_start = align_up(target, commit);
        let tail_len = align_down(self.kernel_extent() - tail_start, commit);

        if tail_len > 0 {
            // SAFETY: the tail lies within the owned extent
            unsafe { sys::unmap_partial(self.ptr.add(tail_start), tail_len) };
        }

        self.len = target;
    }

    /// Declares a page range uninteresting. Never observably destroys
    /// mapped file contents.
    pub fn discard(&self, offset: usize, len: usize) {
        let commit = vm::commit_granularity();
        let start = align_up(offset, commit);
        let end = align_down(offset + len, commit);
        if start >= end || end > self.len {
            return;
        }

        // SAFETY: the range lies within the owned span
        unsafe { sys::discard(self.ptr.add(start), end - start) };
    }

    /// Schedules dirty pages for writeback without waiting for completion.
    /// A no-op for anonymous views, which have nothing to write back to.
    pub fn flush_async(&self, offset: usize, len: usize) -> Result<()> {
        if self.is_empty() || !self.file_backed {
            return Ok(());
        }
        sys::flush(self.ptr, self.len, offset, len, false)
    }

    /// Flushes dirty pages and waits until both the view-to-cache and the
    /// cache-to-storage steps have completed.
    pub fn flush_blocking(&self, offset: usize, len: usize, mapping: &Mapping) -> Result<()> {
        if self.is_empty() || !self.file_backed {
            return Ok(());
        }
        sys::flush(self.ptr, self.len, offset, len, true)?;
        if let Some(file) = mapping.file() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Releases the view. The backing (file contents) survives.
    pub fn unmap(&mut self) {
        if !self.is_empty() {
            // SAFETY: the extent is owned by this view
            unsafe { sys::unmap(self.ptr, self.kernel_extent(), self.file_backed) };
        }
        *self = Self::empty();
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        self.unmap();
    }
}

// consistency probe after a relocating file-view expansion
fn same_prefix(a: *const u8, b: *const u8, len: usize) -> bool {
    // SAFETY: both spans are live for `len` bytes at the call sites
    unsafe { std::slice::from_raw_parts(a, len) == std::slice::from_raw_parts(b, len) }
}

#[cfg(unix)]
mod sys {
    use super::{AccessMode, Error, Mapping, NonNull, Result};
    use crate::vm;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    fn protection(access: AccessMode) -> libc::c_int {
        match access {
            AccessMode::None => libc::PROT_NONE,
            AccessMode::Read => libc::PROT_READ,
            AccessMode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            AccessMode::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        }
    }

    pub fn map_file(
        file: &File,
        access: AccessMode,
        offset: u64,
        size: usize,
    ) -> Result<NonNull<u8>> {
        // SAFETY: the kernel validates the descriptor, offset and length
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                protection(access),
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOMEM) => Err(Error::OutOfMemory),
                _ => Err(err.into()),
            };
        }

        NonNull::new(ptr.cast()).ok_or(Error::OutOfMemory)
    }

    /// In-place (or host-assisted) growth of an existing file view.
    /// `Ok(None)` means the caller should fall back to a fresh mapping.
    pub fn grow_file_view(
        mapping: &Mapping,
        base: NonNull<u8>,
        current_extent: usize,
        target: usize,
    ) -> Result<Option<NonNull<u8>>> {
        #[cfg(target_os = "linux")]
        {
            let _ = mapping;
            // SAFETY: the range is a live owned mapping
            let remapped = unsafe {
                libc::mremap(
                    base.as_ptr().cast(),
                    current_extent,
                    target,
                    libc::MREMAP_MAYMOVE,
                )
            };
            if remapped == libc::MAP_FAILED {
                return Ok(None);
            }
            return Ok(NonNull::new(remapped.cast()));
        }

        #[cfg(not(target_os = "linux"))]
        {
            // Adjacent-tail mapping at the matching file offset. The target
            // address is only a hint on POSIX, so a mismatch is unmapped
            // again and reported as "fall back".
            let file = mapping.file().expect("file-backed view");
            let tail = unsafe { base.as_ptr().add(current_extent) };
            let additional = target - current_extent;

            // SAFETY: hinted mapping, never MAP_FIXED
            let ptr = unsafe {
                libc::mmap(
                    tail.cast(),
                    additional,
                    protection(mapping.access()),
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    current_extent as libc::off_t,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Ok(None);
            }
            if ptr.cast() != tail {
                // SAFETY: we own the mapping we just created
                unsafe { libc::munmap(ptr, additional) };
                return Ok(None);
            }
            Ok(Some(base))
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, extent: usize, _file_backed: bool) {
        unsafe { libc::munmap(ptr.cast(), extent) };
    }

    pub unsafe fn unmap_partial(ptr: *mut u8, len: usize) {
        unsafe { libc::munmap(ptr.cast(), len) };
    }

    pub unsafe fn discard(ptr: *mut u8, len: usize) {
        unsafe { libc::madvise(ptr.cast(), len, libc::MADV_DONTNEED) };
    }

    pub fn flush(
        base: *mut u8,
        view_len: usize,
        offset: usize,
        len: usize,
        blocking: bool,
    ) -> Result<()> {
        let page = vm::commit_granularity();
        let start = vm::align_down(offset, page);
        let end = (offset + len).min(view_len);
        if start >= end {
            return Ok(());
        }

        let flags = if blocking {
            libc::MS_SYNC
        } else {
            libc::MS_ASYNC
        };

        // SAFETY: the aligned range lies within the owned span
        let result = unsafe { libc::msync(base.add(start).cast(), end - start, flags) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::{AccessMode, Error, Mapping, NonNull, Result};
    use std::fs::File;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, DiscardVirtualMemory, FlushViewOfFile, MapViewOfFile,
        UnmapViewOfFile, VirtualFree, FILE_MAP_EXECUTE, FILE_MAP_READ, FILE_MAP_WRITE,
        MEM_RELEASE, PAGE_EXECUTE_READ, PAGE_READONLY, PAGE_READWRITE,
    };
    use windows_sys::Win32::Foundation::CloseHandle;

    fn page_protection(access: AccessMode) -> u32 {
        match access {
            AccessMode::None | AccessMode::Read => PAGE_READONLY,
            AccessMode::ReadWrite => PAGE_READWRITE,
            AccessMode::ReadExecute => PAGE_EXECUTE_READ,
        }
    }

    fn view_access(access: AccessMode) -> u32 {
        match access {
            AccessMode::None | AccessMode::Read => FILE_MAP_READ,
            AccessMode::ReadWrite => FILE_MAP_READ | FILE_MAP_WRITE,
            AccessMode::ReadExecute => FILE_MAP_READ | FILE_MAP_EXECUTE,
        }
    }

    pub fn map_file(
        file: &File,
        access: AccessMode,
        offset: u64,
        size: usize,
    ) -> Result<NonNull<u8>> {
        let max = offset + size as u64;

        // SAFETY: the handle is owned by `file` for the duration of the call
        let section = unsafe {
            CreateFileMappingW(
                file.as_raw_handle(),
                std::ptr::null(),
                page_protection(access),
                (max >> 32) as u32,
                max as u32,
                std::ptr::null(),
            )
        };
        if section.is_null() {
            return Err(std::io::Error::last_os_error().into());
        }

        // The view keeps the pages alive; the section handle can go.
        let ptr = unsafe {
            MapViewOfFile(
                section,
                view_access(access),
                (offset >> 32) as u32,
                offset as u32,
                size,
            )
        };
        unsafe { CloseHandle(section) };

        NonNull::new(ptr.Value.cast()).ok_or(Error::OutOfMemory)
    }

    pub fn grow_file_view(
        _mapping: &Mapping,
        _base: NonNull<u8>,
        _current_extent: usize,
        _target: usize,
    ) -> Result<Option<NonNull<u8>>> {
        // Windows views are per-section; growth goes through a fresh map.
        Ok(None)
    }

    pub unsafe fn unmap(ptr: *mut u8, extent: usize, file_backed: bool) {
        if file_backed {
            unsafe {
                UnmapViewOfFile(windows_sys::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: ptr.cast(),
                })
            };
        } else {
            let _ = extent;
            unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
        }
    }

    pub unsafe fn unmap_partial(_ptr: *mut u8, _len: usize) {
        // best effort only: per-region mappings cannot return a tail
    }

    pub unsafe fn discard(ptr: *mut u8, len: usize) {
        unsafe { DiscardVirtualMemory(ptr.cast(), len) };
    }

    pub fn flush(
        base: *mut u8,
        view_len: usize,
        offset: usize,
        len: usize,
        _blocking: bool,
    ) -> Result<()> {
        let end = (offset + len).min(view_len);
        if offset >= end {
            return Ok(());
        }

        // SAFETY: the range lies within the owned span
        let ok = unsafe { FlushViewOfFile(base.add(offset).cast(), end - offset) };
        if ok == 0 {
            Err(std::io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::OpenPolicy;
    use test_log::test;

    #[test]
    fn anonymous_round_trip() {
        let mapping = Mapping::anonymous(AccessMode::ReadWrite);
        let mut view = MappedView::map(&mapping, 0, 8192).expect("map");

        view.as_mut_slice()[0] = 1;
        view.as_mut_slice()[8191] = 2;
        assert_eq!(view.as_slice()[0], 1);
        assert_eq!(view.as_slice()[8191], 2);
    }

    #[test]
    fn anonymous_expand_preserves_contents() {
        let mapping = Mapping::anonymous(AccessMode::ReadWrite);
        let mut view = MappedView::map(&mapping, 0, 4096).expect("map");

        for (i, byte) in view.as_mut_slice().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        view.expand(1 << 20, &mapping).expect("expand");
        assert_eq!(view.len(), 1 << 20);

        for (i, byte) in view.as_slice()[..4096].iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8);
        }
    }

    #[test]
    fn file_view_persists_and_expands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("view");

        {
            let mapping = Mapping::open(
                &path,
                OpenPolicy::CreateNew,
                AccessMode::ReadWrite,
            )
            .expect("open");
            mapping.set_size(4096).expect("set_size");

            let mut view = MappedView::map(&mapping, 0, 4096).expect("map");
            view.as_mut_slice()[..5].copy_from_slice(b"hello");

            mapping.set_size(1 << 20).expect("grow file");
            view.expand(1 << 20, &mapping).expect("grow view");
            view.as_mut_slice()[(1 << 20) - 1] = 0xFF;

            view.flush_blocking(0, 1 << 20, &mapping).expect("flush");
        }

        let mapping =
            Mapping::open(&path, OpenPolicy::OpenExisting, AccessMode::Read).expect("reopen");
        let view = MappedView::map(&mapping, 0, 1 << 20).expect("map");
        assert_eq!(&view.as_slice()[..5], b"hello");
        assert_eq!(view.as_slice()[(1 << 20) - 1], 0xFF);
    }

    #[test]
    fn shrink_narrows_the_span() {
        let mapping = Mapping::anonymous(AccessMode::ReadWrite);
        let mut view = MappedView::map(&mapping, 0, 1 << 20).expect("map");

        view.as_mut_slice()[100] = 42;
        view.shrink(4096);
        assert_eq!(view.len(), 4096);
        assert_eq!(view.as_slice()[100], 42);
    }
}
