// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Memory-mapped views over file or anonymous backings.

mod file;
mod view;

pub use view::MappedView;

use crate::{Error, Result};
use std::fs::File;
use std::path::Path;

/// Requested protection for a mapped view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// No access; address-space reservation only.
    None,
    /// Read-only.
    Read,
    /// Read-write. Required for tree mutation.
    ReadWrite,
    /// Read-execute.
    ReadExecute,
}

impl AccessMode {
    #[must_use]
    pub fn is_writable(self) -> bool {
        self == Self::ReadWrite
    }
}

/// How [`Mapping::open`] treats an existing (or missing) backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Error if the file exists.
    CreateNew,
    /// Always start with an empty file.
    CreateNewOrTruncateExisting,
    /// Error if the file is missing.
    OpenExisting,
    /// Open if present, create empty otherwise.
    OpenOrCreate,
    /// Error if missing, else truncate to zero and re-initialise.
    OpenAndTruncateExisting,
}

enum Backing {
    Anonymous,
    File(File),
}

/// The backing store a view is derived from: a file handle or anonymous,
/// process-private memory.
pub struct Mapping {
    backing: Backing,
    access: AccessMode,
}

impl Mapping {
    /// An anonymous, process-private backing.
    #[must_use]
    pub fn anonymous(access: AccessMode) -> Self {
        Self {
            backing: Backing::Anonymous,
            access,
        }
    }

    /// Wraps an already-opened file.
    #[must_use]
    pub fn with_file(file: File, access: AccessMode) -> Self {
        Self {
            backing: Backing::File(file),
            access,
        }
    }

    /// Opens (or creates) the backing file at `path` per `policy`.
    pub fn open(path: &Path, policy: OpenPolicy, access: AccessMode) -> Result<Self> {
        let file = file::open(path, policy, access)?;
        Ok(Self::with_file(file, access))
    }

    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    #[must_use]
    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub(crate) fn file(&self) -> Option<&File> {
        match &self.backing {
            Backing::File(file) => Some(file),
            Backing::Anonymous => None,
        }
    }

    /// Size of the backing store in bytes (0 for anonymous backings).
    pub fn size(&self) -> Result<u64> {
        match &self.backing {
            Backing::File(file) => Ok(file.metadata()?.len()),
            Backing::Anonymous => Ok(0),
        }
    }

    /// Grows or truncates the backing file.
    pub fn set_size(&self, len: u64) -> Result<()> {
        match &self.backing {
            Backing::File(file) => {
                if !self.access.is_writable() {
                    return Err(Error::ReadOnly);
                }
                file.set_len(len)?;
                Ok(())
            }
            Backing::Anonymous => Ok(()),
        }
    }
}
