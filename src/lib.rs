#![deny(missing_docs)]

//! Ordered key-value container built on a red-black tree, in particular [`collections::RBTree`].
//!
//! Entries can carry release hooks so an owning system is told whenever a key or value
//! is discarded by replace, remove or drop. Node storage comes from an [`alloc::Allocator`];
//! [`alloc::Pool`] lets many trees share one lock-guarded pool of released buffers.
//!
//!# Example
//!
//! ```
//!     use redblack::collections::RBTree;
//!     let mut t = RBTree::new();
//!     t.insert(5, "a");
//!     t.insert(3, "b");
//!     t.insert(8, "c");
//!     assert_eq!(t.lookup(&3), Some(&"b"));
//!     assert_eq!(t.size(), 3);
//! ```
//!
//!# Features
//!
//! This crate supports the following cargo features:
//! - `unsafe-optim` : Enable unsafe optimisations in release mode.
//! - `tracing` : emit trace/debug events through the `tracing` crate.
//! - `cap` : ( tests only ) account allocations with `cap` instead of using `mimalloc`.

#[macro_use]
mod trace;

/// Memory allocation.
pub mod alloc;

/// Containers.
pub mod collections;
