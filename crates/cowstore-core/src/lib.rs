//! # cowstore Core
//!
//! Copy-on-write B-tree containers with snapshots.
//!
//! This crate provides:
//! - **CoW allocator**: reference counts across snapshots, copy-on-write,
//!   worklist garbage collection and image persistence
//! - **Packed layouts**: varints, item codecs, rank/select bitmaps and the
//!   branch index encoding
//! - **B-tree engine**: balanced trees written once against a [`Shape`],
//!   with walkers and pinned cursors
//! - **Containers**: [`Vector`], [`Map`], [`Set`], [`Multimap`],
//!   [`WeightedTree`] and [`AllocationMap`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Containers (typed front ends)    │
//! ├─────────────────────────────────────────┤
//! │   B-tree engine   │   Walkers / Cursors │
//! ├─────────────────────────────────────────┤
//! │          Packed node layouts            │
//! ├─────────────────────────────────────────┤
//! │      CoW allocator and snapshots        │
//! ├─────────────────────────────────────────┤
//! │        BlockStore (blockstore)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use cowstore_core::{Allocator, EngineConfig, Lookup, Map};
//!
//! let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
//! let main = alloc.create_snapshot(Some("main"));
//! let mut users: Map<u64, String> = main.create_named("users").unwrap();
//! users.insert(1, "ada".to_string()).unwrap();
//! main.commit().unwrap();
//!
//! let draft = main.branch(Some("draft")).unwrap();
//! let mut draft_users: Map<u64, String> = draft.open_named("users").unwrap();
//! draft_users.insert(2, "grace".to_string()).unwrap();
//!
//! assert_eq!(users.len().unwrap(), 1);
//! assert_eq!(draft_users.len().unwrap(), 2);
//! ```

pub mod alloc;
pub mod btree;
pub mod config;
pub mod containers;
pub mod error;
pub mod packed;
pub mod registry;

pub use alloc::{
    AllocStats, Allocator, CtrId, GcStats, Snapshot, SnapshotId, SnapshotInfo, IMAGE_MAGIC,
    IMAGE_VERSION,
};
pub use btree::{Cursor, Duplicates, Entries, Shape, Tree, TreeStats, Walker};
pub use config::EngineConfig;
pub use containers::{
    AllocationMap, Container, Lookup, Map, Multimap, Mutator, Set, Vector, WalkerHost,
    WeightedTree,
};
pub use error::{CoreError, Result};
pub use registry::{Signature, TypeRegistry};
