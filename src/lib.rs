// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, memory-mapped B+ tree on top of a growable
//! virtual-memory vector.
//!
//! ##### About
//!
//! Three layers, composed bottom-up:
//!
//! - [`vm`]: reserve/commit/free of page-granular address ranges and
//!   contiguous in-place region expansion without copying (the portable
//!   analogue of `mremap`).
//! - [`VmVector`]: a growable, header-prefixed sequence of POD elements
//!   whose storage is a single mapped view over a file or anonymous
//!   memory, resized in place whenever the host allows.
//! - [`BpTree`] (with the [`BpSet`] / [`BpMultiSet`] aliases): an ordered
//!   set or multiset whose page-sized nodes live inside a `VmVector`,
//!   addressed by compact 32-bit slots. Persistence is automatic: opening
//!   the same backing file restores the tree exactly, and the file is
//!   position-independent because the node graph never stores pointers.
//!
//! A tree (or vector) instance is owned by one thread of control at a
//! time; there is no internal synchronisation. Durability is explicit
//! through the `flush_*` operations.
//!
//! # Example usage
//!
//! ```
//! use vm_tree::{BpSet, OpenPolicy};
//! #
//! # let dir = tempfile::tempdir()?;
//! # let path = dir.path().join("numbers.bpt");
//!
//! let mut tree = BpSet::<u64>::new();
//! tree.map_file(&path, OpenPolicy::CreateNew)?;
//!
//! tree.insert(42)?;
//! tree.insert(7)?;
//! assert!(tree.contains(&42));
//! assert_eq!(tree.iter().collect::<Vec<_>>(), vec![7, 42]);
//!
//! tree.flush_blocking()?;
//! drop(tree);
//!
//! // reopening the file restores the tree
//! let mut tree = BpSet::<u64>::new();
//! tree.map_file(&path, OpenPolicy::OpenExisting)?;
//! assert_eq!(tree.len(), 2);
//! #
//! # Ok::<(), vm_tree::Error>(())
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod comparator;
mod error;

pub mod mapping;
pub mod vector;
pub mod vm;

mod tree;

pub use comparator::{Comparator, NaturalOrder};
pub use error::{Error, Result};
pub use mapping::{AccessMode, Mapping, OpenPolicy};
pub use tree::{BpMultiSet, BpSet, BpTree, Cursor, Iter, RaIter};
pub use vector::{GrowthPolicy, VmVector, HEADER_SIZE};
