//! # cowstore
//!
//! Embeddable copy-on-write B-tree containers with snapshots over a block
//! store.
//!
//! This crate re-exports the two layers:
//! - [`blockstore`]: block ids, checksummed blocks and stores
//! - [`core`]: allocator, snapshots, the B-tree engine and containers
//!
//! The most common names are also available at the top level.

pub use cowstore_blockstore as blockstore;
pub use cowstore_core as core;

pub use cowstore_blockstore::{BlockId, BlockStore, BlockStoreError, MemoryBlockStore};
pub use cowstore_core::{
    AllocationMap, Allocator, Container, CoreError, CtrId, EngineConfig, GcStats, Lookup, Map,
    Multimap, Mutator, Result, Set, Snapshot, SnapshotId, TypeRegistry, Vector, WalkerHost,
    WeightedTree,
};
