// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{AccessMode, OpenPolicy};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Opens or creates the file at `path` per `policy`.
pub fn open(path: &Path, policy: OpenPolicy, access: AccessMode) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(access.is_writable());

    match policy {
        OpenPolicy::CreateNew => {
            options.create_new(true);
        }
        OpenPolicy::CreateNewOrTruncateExisting => {
            options.create(true).truncate(true);
        }
        OpenPolicy::OpenExisting => {}
        OpenPolicy::OpenOrCreate => {
            options.create(true);
        }
        OpenPolicy::OpenAndTruncateExisting => {
            options.truncate(true);
        }
    }

    log::trace!("opening backing file {path:?} ({policy:?})");
    Ok(options.open(path)?)
}
