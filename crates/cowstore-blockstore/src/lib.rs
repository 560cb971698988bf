//! # cowstore Blockstore
//!
//! Raw block storage layer for the cowstore engine.
//!
//! This crate provides:
//! - **Block ids**: 128-bit identifiers that are never reused
//! - **Block images**: typed 32-byte header, payload and BLAKE3 checksum
//! - **Stores**: a bounded in-memory store and an LRU-cached wrapper
//! - **Persistence**: the block section of an engine image
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          CoW Allocator (core)           │
//! ├─────────────────────────────────────────┤
//! │           BlockStore Trait              │
//! ├────────────────────┬────────────────────┤
//! │  CachedBlockStore  │  MemoryBlockStore  │
//! ├────────────────────┴────────────────────┤
//! │        Block section (persist/load)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use cowstore_blockstore::{Block, BlockStore, MemoryBlockStore};
//!
//! let store = MemoryBlockStore::new();
//! let id = store.allocate(4096).unwrap();
//! store.write(&id, &Block::raw(&b"hello"[..])).unwrap();
//! assert_eq!(store.read(&id).unwrap().as_slice(), b"hello");
//! ```

pub mod block;
pub mod error;
pub mod memory;
pub mod section;

pub use block::{Block, BlockHeader, BlockId, BlockKind, FORMAT_VERSION, HEADER_LEN};
pub use error::{BlockStoreError, Result};
pub use memory::{CachedBlockStore, MemoryBlockStore};
pub use section::{read_section, write_section, SectionEntry};

use std::io::{Read, Write};
use std::sync::Arc;

/// Default block size (4 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Maximum block size (1 MiB)
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Occupancy figures for a store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of allocated blocks
    pub blocks: usize,
    /// Bytes claimed by allocations
    pub bytes_used: u64,
    /// Byte capacity, if bounded
    pub capacity: Option<u64>,
}

/// Trait for block storage backends
///
/// Calls are synchronous and may block on I/O. Failures are returned
/// immediately; callers decide whether to retry.
pub trait BlockStore: Send + Sync {
    /// Claim a slot of `size` bytes and return its fresh id
    fn allocate(&self, size: usize) -> Result<BlockId>;

    /// Read and verify a block
    fn read(&self, id: &BlockId) -> Result<Block>;

    /// Replace the contents of an allocated block as a whole
    fn write(&self, id: &BlockId, block: &Block) -> Result<()>;

    /// Release a block's slot
    fn free(&self, id: &BlockId) -> Result<()>;

    /// Check if a block id is allocated
    fn contains(&self, id: &BlockId) -> bool;

    /// Allocation size of a block
    fn block_size(&self, id: &BlockId) -> Result<usize>;

    /// All allocated block ids, sorted
    fn block_ids(&self) -> Vec<BlockId>;

    /// Occupancy figures
    fn stats(&self) -> StoreStats;

    /// Write every written block as a block section
    fn persist(&self, out: &mut dyn Write) -> Result<()>;

    /// Add the blocks of a block section to this store
    fn load(&self, input: &mut dyn Read) -> Result<()>;

    /// Allocate a slot of the same size as `id` and return it with a copy of
    /// the block, ready to be modified and written to the new id
    fn writable_copy(&self, id: &BlockId) -> Result<(BlockId, Block)> {
        let block = self.read(id)?;
        let copy = self.allocate(self.block_size(id)?)?;
        Ok((copy, block))
    }
}

impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn allocate(&self, size: usize) -> Result<BlockId> {
        (**self).allocate(size)
    }

    fn read(&self, id: &BlockId) -> Result<Block> {
        (**self).read(id)
    }

    fn write(&self, id: &BlockId, block: &Block) -> Result<()> {
        (**self).write(id, block)
    }

    fn free(&self, id: &BlockId) -> Result<()> {
        (**self).free(id)
    }

    fn contains(&self, id: &BlockId) -> bool {
        (**self).contains(id)
    }

    fn block_size(&self, id: &BlockId) -> Result<usize> {
        (**self).block_size(id)
    }

    fn block_ids(&self) -> Vec<BlockId> {
        (**self).block_ids()
    }

    fn stats(&self) -> StoreStats {
        (**self).stats()
    }

    fn persist(&self, out: &mut dyn Write) -> Result<()> {
        (**self).persist(out)
    }

    fn load(&self, input: &mut dyn Read) -> Result<()> {
        (**self).load(input)
    }
}
