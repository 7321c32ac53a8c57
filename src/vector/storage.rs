// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::mapping::{AccessMode, MappedView, Mapping, OpenPolicy};
use crate::{Error, Result};
use std::path::Path;

/// A mapping and the single view over it, shared plumbing for the
/// header-prefixed containers.
pub(crate) struct MappedStorage {
    mapping: Option<Mapping>,
    view: MappedView,
}

impl MappedStorage {
    pub const fn detached() -> Self {
        Self {
            mapping: None,
            view: MappedView::empty(),
        }
    }

    /// Opens (or creates) a file backing. Returns the storage and whether a
    /// fresh file was created. The mapped extent is at least `min_size`.
    pub fn open(
        path: &Path,
        policy: OpenPolicy,
        access: AccessMode,
        min_size: usize,
    ) -> Result<(Self, bool)> {
        let mapping = Mapping::open(path, policy, access)?;

        let existing = usize::try_from(mapping.size()?)
            .map_err(|_| Error::Corrupted("backing file larger than the address space"))?;
        let created = existing == 0;

        if !created && existing < min_size {
            return Err(Error::Corrupted("backing file too small for its header"));
        }

        let mapping_size = existing.max(min_size);
        if mapping_size > existing {
            mapping.set_size(mapping_size as u64)?;
        }

        let view = MappedView::map(&mapping, 0, mapping_size)?;

        Ok((
            Self {
                mapping: Some(mapping),
                view,
            },
            created,
        ))
    }

    /// Creates an anonymous, process-private backing of `initial_size`
    /// bytes.
    pub fn map_memory(initial_size: usize) -> Result<Self> {
        let mapping = Mapping::anonymous(AccessMode::ReadWrite);
        let view = MappedView::map(&mapping, 0, initial_size)?;
        Ok(Self {
            mapping: Some(mapping),
            view,
        })
    }

    pub fn has_storage(&self) -> bool {
        self.mapping.is_some() && !self.view.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.mapping
            .as_ref()
            .is_some_and(|m| !m.access().is_writable())
    }

    pub fn mapped_size(&self) -> usize {
        self.view.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.view.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.view.as_mut_slice()
    }

    pub fn data(&self) -> *mut u8 {
        self.view.data()
    }

    /// Grows the backing (file first, then the view) to `target` bytes.
    pub fn expand(&mut self, target: usize) -> Result<()> {
        let mapping = self.mapping.as_ref().ok_or(Error::OutOfMemory)?;
        if !mapping.access().is_writable() && mapping.is_file_backed() {
            return Err(Error::ReadOnly);
        }

        // Windows refuses to grow a file that still has a mapped section,
        // so the old view goes first there (contents live in the file).
        #[cfg(windows)]
        if mapping.is_file_backed() {
            self.view.unmap();
        }

        mapping.set_size(target as u64)?;
        self.view.expand(target, mapping)
    }

    /// Shrinks the view and, for files, the backing itself.
    pub fn shrink(&mut self, target: usize) {
        self.view.shrink(target);
        if let Some(mapping) = &self.mapping {
            // a failed file truncation only wastes slack
            let _ = mapping.set_size(target as u64);
        }
    }

    pub fn flush_async(&self) -> Result<()> {
        self.view.flush_async(0, self.view.len())
    }

    pub fn flush_blocking(&self) -> Result<()> {
        match &self.mapping {
            Some(mapping) => self.view.flush_blocking(0, self.view.len(), mapping),
            None => Ok(()),
        }
    }

    pub fn detach(&mut self) {
        self.view.unmap();
        self.mapping = None;
    }
}
