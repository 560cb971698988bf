//! Garbage collection of unreferenced blocks

use super::{AllocState, Allocator};
use crate::packed::branch;
use crate::{CoreError, Result};
use cowstore_blockstore::{BlockId, BlockKind};
use tracing::{debug, instrument};

/// Outcome of a collection pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub freed_blocks: u64,
    pub freed_bytes: u64,
}

impl GcStats {
    fn absorb(&mut self, other: GcStats) {
        self.freed_blocks += other.freed_blocks;
        self.freed_bytes += other.freed_bytes;
    }
}

impl Allocator {
    /// Free every block whose reference count has reached zero
    ///
    /// Freeing a branch releases its children, which may cascade. Running
    /// this twice in a row frees nothing the second time.
    #[instrument(skip(self))]
    pub fn gc(&self) -> Result<GcStats> {
        let mut state = self.state.write();
        let mut worklist = std::mem::take(&mut state.pending);
        let mut stats = GcStats::default();
        while let Some(id) = worklist.pop() {
            match self.reclaim(&mut state, &id, &mut worklist) {
                Ok(freed) => stats.absorb(freed),
                Err(err) => {
                    worklist.push(id);
                    state.pending.append(&mut worklist);
                    return Err(err);
                }
            }
        }
        if stats.freed_blocks > 0 {
            debug!(
                freed_blocks = stats.freed_blocks,
                freed_bytes = stats.freed_bytes,
                "collected garbage"
            );
        }
        Ok(stats)
    }

    /// Free one block nobody references
    ///
    /// Untracked blocks (allocated but never published) are released
    /// directly. Tracked blocks must have a zero reference count; freeing a
    /// tracked branch releases its children, and those reaching zero are
    /// collected on the next [`gc`](Self::gc).
    pub fn free_block(&self, id: &BlockId) -> Result<GcStats> {
        let mut state = self.state.write();
        match state.blocks.get(id).map(|meta| meta.refs) {
            None => {
                let size = self.store.block_size(id)? as u64;
                self.store.free(id)?;
                Ok(GcStats {
                    freed_blocks: 1,
                    freed_bytes: size,
                })
            }
            Some(refs) if refs > 0 => Err(CoreError::BlockStore(
                cowstore_blockstore::BlockStoreError::InvalidBlockState {
                    id: *id,
                    reason: format!("block still has {} references", refs),
                },
            )),
            Some(_) => {
                let mut released = Vec::new();
                let stats = self.reclaim(&mut state, id, &mut released)?;
                state.pending.retain(|pending| pending != id);
                state.pending.append(&mut released);
                Ok(stats)
            }
        }
    }

    /// Free `id` if it is still unreferenced, queueing children that reach
    /// zero onto `worklist`
    fn reclaim(
        &self,
        state: &mut AllocState,
        id: &BlockId,
        worklist: &mut Vec<BlockId>,
    ) -> Result<GcStats> {
        // Re-referenced or already freed since it was queued
        match state.blocks.get(id) {
            Some(meta) if meta.refs == 0 => {}
            _ => return Ok(GcStats::default()),
        }

        let block = self.store.read(id)?;
        if block.header.kind == BlockKind::Branch {
            let children = branch::child_ids(&block.payload)
                .map_err(|e| CoreError::corrupt(*id, e.to_string()))?;
            for child in children {
                if let Some(meta) = state.blocks.get_mut(&child) {
                    meta.refs = meta.refs.checked_sub(1).ok_or_else(|| {
                        CoreError::InvariantViolation(format!(
                            "reference count of {} underflowed",
                            child
                        ))
                    })?;
                    if meta.refs == 0 {
                        worklist.push(child);
                    }
                }
            }
        }

        let size = self.store.block_size(id)? as u64;
        self.store.free(id)?;
        state.blocks.remove(id);
        Ok(GcStats {
            freed_blocks: 1,
            freed_bytes: size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::containers::{Lookup, Map, Mutator};

    #[test]
    fn test_gc_is_idempotent() {
        let alloc = Allocator::in_memory(EngineConfig::default().with_auto_gc(false)).unwrap();
        let snap = alloc.create_snapshot(None);
        let mut map: Map<u64, u64> = snap.create().unwrap();
        for i in 0..2_000 {
            map.insert(i, i).unwrap();
        }
        map.clear().unwrap();
        assert_eq!(map.len().unwrap(), 0);

        let first = alloc.gc().unwrap();
        assert!(first.freed_blocks > 0);
        assert_eq!(alloc.gc().unwrap(), GcStats::default());
        assert_eq!(alloc.stats().pending_blocks, 0);
    }

    #[test]
    fn test_auto_gc_follows_every_write() {
        for auto_gc in [true, false] {
            let config = EngineConfig::default().with_block_size(256).with_auto_gc(auto_gc);
            let alloc = Allocator::in_memory(config).unwrap();
            let snap = alloc.create_snapshot(None);
            let mut map: Map<u64, u64> = snap.create().unwrap();
            for i in 0..500 {
                map.insert(i, i).unwrap();
            }
            map.remove_range(100..400).unwrap();

            // No snapshot was dropped, only container writes ran
            assert_eq!(alloc.stats().pending_blocks == 0, auto_gc);
        }
    }

    #[test]
    fn test_free_block_rejects_referenced() {
        let alloc = Allocator::in_memory(EngineConfig::default()).unwrap();
        let snap = alloc.create_snapshot(None);
        let map: Map<u64, u64> = snap.create().unwrap();
        let root = crate::containers::Container::tree(&map).root_id().unwrap();
        assert!(alloc.free_block(&root).is_err());

        let scratch = alloc.allocate_block().unwrap();
        assert_eq!(alloc.free_block(&scratch).unwrap().freed_blocks, 1);
        assert!(!alloc.store().contains(&scratch));
    }
}
