// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the virtual-memory toolkit
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Out of virtual address space or physical memory
    OutOfMemory,

    /// Out of disk space while growing a file-backed mapping
    OutOfDiskSpace,

    /// Mutation attempted through a read-only mapping
    ReadOnly,

    /// Invalid or unparsable on-disk state
    Corrupted(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VmTreeError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        // Growing a file-backed mapping surfaces exhaustion as an I/O error,
        // but callers match on the resource-exhaustion kinds.
        match value.kind() {
            std::io::ErrorKind::StorageFull => Self::OutOfDiskSpace,
            std::io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Io(value),
        }
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
