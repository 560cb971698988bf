//! Copy-on-write allocator
//!
//! The allocator owns the block store and all bookkeeping around it:
//!
//! - a reference count per live block: one per parent branch or snapshot
//!   directory that points at it, plus one per cursor pinning it
//! - the epoch each block was written in
//! - the snapshot table with each snapshot's container directory
//!
//! A block may be rewritten in place only by a mutable snapshot that holds
//! the sole reference and wrote the block itself (same epoch). Everything
//! else is copied on write. Blocks whose count drops to zero wait in a
//! pending list until [`Allocator::gc`] frees them.

mod gc;
mod image;
mod snapshot;

pub use gc::GcStats;
pub use image::{IMAGE_MAGIC, IMAGE_VERSION};
pub use snapshot::{CtrId, Snapshot, SnapshotId, SnapshotInfo};

pub(crate) use snapshot::{DirEntry, SnapshotMeta};

use crate::config::EngineConfig;
use crate::registry::{Signature, TypeRegistry};
use crate::{CoreError, Result};
use cowstore_blockstore::{
    Block, BlockId, BlockStore, BlockStoreError, CachedBlockStore, MemoryBlockStore, StoreStats,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Bookkeeping for one live block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockMeta {
    pub refs: u32,
    pub epoch: u64,
}

#[derive(Default)]
pub(crate) struct AllocState {
    pub blocks: HashMap<BlockId, BlockMeta>,
    pub pending: Vec<BlockId>,
    pub snapshots: BTreeMap<SnapshotId, SnapshotMeta>,
    pub next_epoch: u64,
}

impl AllocState {
    fn incref(&mut self, id: &BlockId) -> Result<()> {
        let meta = self.blocks.get_mut(id).ok_or_else(|| untracked(id))?;
        meta.refs += 1;
        Ok(())
    }

    fn decref(&mut self, id: &BlockId) -> Result<()> {
        let meta = self.blocks.get_mut(id).ok_or_else(|| untracked(id))?;
        meta.refs = meta.refs.checked_sub(1).ok_or_else(|| {
            CoreError::InvariantViolation(format!("reference count of {} underflowed", id))
        })?;
        if meta.refs == 0 {
            self.pending.push(*id);
        }
        Ok(())
    }

    fn snapshot(&self, id: SnapshotId) -> Result<&SnapshotMeta> {
        self.snapshots.get(&id).ok_or(CoreError::SnapshotNotFound(id))
    }

    fn mutable_snapshot(&mut self, id: SnapshotId) -> Result<&mut SnapshotMeta> {
        let meta = self
            .snapshots
            .get_mut(&id)
            .ok_or(CoreError::SnapshotNotFound(id))?;
        if meta.committed {
            return Err(CoreError::IllegalMutation(format!(
                "snapshot {} is committed",
                id
            )));
        }
        Ok(meta)
    }

    fn take_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

fn untracked(id: &BlockId) -> CoreError {
    CoreError::BlockStore(BlockStoreError::InvalidBlockState {
        id: *id,
        reason: "block is not tracked by the allocator".to_string(),
    })
}

/// Everything a finished transaction hands to the allocator
#[derive(Debug, Default)]
pub(crate) struct CommitPlan {
    pub writes: Vec<(BlockId, Block)>,
    /// Blocks allocated by the transaction and written now
    pub fresh: Vec<BlockId>,
    pub increments: Vec<BlockId>,
    pub decrements: Vec<BlockId>,
}

/// Allocator statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocStats {
    pub snapshots: usize,
    /// Blocks with bookkeeping (live or awaiting collection)
    pub tracked_blocks: usize,
    /// Blocks whose count reached zero and await collection
    pub pending_blocks: usize,
    pub store: StoreStats,
}

/// Copy-on-write block allocator and snapshot manager
pub struct Allocator {
    store: Arc<dyn BlockStore>,
    config: EngineConfig,
    registry: Arc<TypeRegistry>,
    state: RwLock<AllocState>,
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Allocator {
    /// Create an allocator over an existing store
    pub fn new(
        store: Arc<dyn BlockStore>,
        config: EngineConfig,
        registry: Arc<TypeRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self::from_parts(
            store,
            config,
            registry,
            AllocState::default(),
        )))
    }

    /// Create an allocator over a fresh in-memory store built from `config`
    pub fn in_memory(config: EngineConfig) -> Result<Arc<Self>> {
        let store = Self::default_store(&config);
        Self::new(store, config, Arc::new(TypeRegistry::with_builtin()))
    }

    pub(crate) fn default_store(config: &EngineConfig) -> Arc<dyn BlockStore> {
        let memory = match config.store_capacity {
            Some(capacity) => MemoryBlockStore::with_capacity(capacity),
            None => MemoryBlockStore::new(),
        };
        if config.block_cache_capacity > 0 {
            Arc::new(CachedBlockStore::new(memory, config.block_cache_capacity))
        } else {
            Arc::new(memory)
        }
    }

    pub(crate) fn from_parts(
        store: Arc<dyn BlockStore>,
        config: EngineConfig,
        registry: Arc<TypeRegistry>,
        state: AllocState,
    ) -> Self {
        Self {
            store,
            config,
            registry,
            state: RwLock::new(state),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    // --- snapshots ---

    /// Create an empty mutable snapshot with no parent
    pub fn create_snapshot(self: &Arc<Self>, label: Option<&str>) -> Snapshot {
        let id = SnapshotId::new();
        let mut state = self.state.write();
        let epoch = state.take_epoch();
        state.snapshots.insert(
            id,
            SnapshotMeta {
                parent: None,
                epoch,
                label: label.map(str::to_string),
                committed: false,
                directory: BTreeMap::new(),
            },
        );
        info!(snapshot = %id, epoch, "created snapshot");
        Snapshot::new(self.clone(), id)
    }

    /// Handle to an existing snapshot
    pub fn snapshot(self: &Arc<Self>, id: SnapshotId) -> Result<Snapshot> {
        self.state.read().snapshot(id)?;
        Ok(Snapshot::new(self.clone(), id))
    }

    pub fn snapshot_info(&self, id: SnapshotId) -> Result<SnapshotInfo> {
        let state = self.state.read();
        Ok(SnapshotInfo::from_meta(id, state.snapshot(id)?))
    }

    /// All snapshots, ordered by epoch
    pub fn snapshots(&self) -> Vec<SnapshotInfo> {
        let state = self.state.read();
        let mut all: Vec<_> = state
            .snapshots
            .iter()
            .map(|(id, meta)| SnapshotInfo::from_meta(*id, meta))
            .collect();
        all.sort_by_key(|info| info.epoch);
        all
    }

    /// Freeze a snapshot; committing twice is a no-op
    #[instrument(skip(self))]
    pub fn commit(&self, id: SnapshotId) -> Result<()> {
        let mut state = self.state.write();
        let meta = state
            .snapshots
            .get_mut(&id)
            .ok_or(CoreError::SnapshotNotFound(id))?;
        if !meta.committed {
            meta.committed = true;
            debug!(snapshot = %id, "committed snapshot");
        }
        Ok(())
    }

    /// Create a mutable child sharing every container of a committed parent
    #[instrument(skip(self))]
    pub fn branch(self: &Arc<Self>, parent: SnapshotId, label: Option<&str>) -> Result<Snapshot> {
        let mut state = self.state.write();
        let parent_meta = state.snapshot(parent)?;
        if !parent_meta.committed {
            return Err(CoreError::SnapshotNotCommitted(parent));
        }
        let directory = parent_meta.directory.clone();
        for entry in directory.values() {
            state.incref(&entry.root)?;
        }
        let id = SnapshotId::new();
        let epoch = state.take_epoch();
        debug!(snapshot = %id, %parent, epoch, containers = directory.len(), "branched snapshot");
        state.snapshots.insert(
            id,
            SnapshotMeta {
                parent: Some(parent),
                epoch,
                label: label.map(str::to_string),
                committed: false,
                directory,
            },
        );
        Ok(Snapshot::new(self.clone(), id))
    }

    /// Drop a snapshot and release its container roots
    ///
    /// Children of the dropped snapshot are re-parented to its parent.
    /// Runs [`gc`](Self::gc) when `auto_gc` is enabled.
    #[instrument(skip(self))]
    pub fn drop_snapshot(&self, id: SnapshotId) -> Result<GcStats> {
        {
            let mut state = self.state.write();
            let meta = state
                .snapshots
                .remove(&id)
                .ok_or(CoreError::SnapshotNotFound(id))?;
            for other in state.snapshots.values_mut() {
                if other.parent == Some(id) {
                    other.parent = meta.parent;
                }
            }
            for entry in meta.directory.values() {
                state.decref(&entry.root)?;
            }
            info!(snapshot = %id, pending = state.pending.len(), "dropped snapshot");
        }
        if self.config.auto_gc {
            self.gc()
        } else {
            Ok(GcStats::default())
        }
    }

    // --- containers ---

    pub(crate) fn snapshot_epoch(&self, snapshot: SnapshotId) -> Result<u64> {
        let mut state = self.state.write();
        Ok(state.mutable_snapshot(snapshot)?.epoch)
    }

    pub(crate) fn container_root(
        &self,
        snapshot: SnapshotId,
        ctr: CtrId,
    ) -> Result<(BlockId, Signature)> {
        let state = self.state.read();
        let entry = state
            .snapshot(snapshot)?
            .directory
            .get(&ctr)
            .ok_or(CoreError::ContainerNotFound(ctr))?;
        Ok((entry.root, entry.signature.clone()))
    }

    /// Add a container whose root is `root_block`
    pub(crate) fn create_container(
        &self,
        snapshot: SnapshotId,
        ctr: CtrId,
        signature: Signature,
        root_block: &Block,
    ) -> Result<BlockId> {
        let mut state = self.state.write();
        let meta = state.mutable_snapshot(snapshot)?;
        if meta.directory.contains_key(&ctr) {
            return Err(CoreError::InvalidArgument(format!(
                "container {} already exists in snapshot {}",
                ctr, snapshot
            )));
        }
        let epoch = meta.epoch;
        let root = self.store.allocate(self.config.block_size)?;
        if let Err(err) = self.store.write(&root, root_block) {
            self.release_fresh(&[root]);
            return Err(err.into());
        }
        state.blocks.insert(root, BlockMeta { refs: 1, epoch });
        if let Some(meta) = state.snapshots.get_mut(&snapshot) {
            meta.directory.insert(ctr, DirEntry { root, signature });
        }
        debug!(%snapshot, %ctr, %root, "created container");
        Ok(root)
    }

    pub(crate) fn remove_container(&self, snapshot: SnapshotId, ctr: CtrId) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .mutable_snapshot(snapshot)?
            .directory
            .remove(&ctr)
            .ok_or(CoreError::ContainerNotFound(ctr))?;
        state.decref(&entry.root)?;
        debug!(%snapshot, %ctr, "removed container");
        Ok(())
    }

    // --- blocks ---

    /// Allocate an untracked block for a transaction to fill
    pub fn allocate_block(&self) -> Result<BlockId> {
        Ok(self.store.allocate(self.config.block_size)?)
    }

    pub fn read_block(&self, id: &BlockId) -> Result<Block> {
        Ok(self.store.read(id)?)
    }

    /// Block id a snapshot may write for `id`
    ///
    /// Returns `id` itself when the snapshot owns the block outright.
    /// Otherwise allocates a fresh block of the same size; the caller writes
    /// the copy there and the original stays untouched.
    pub fn mutate(&self, snapshot: SnapshotId, id: BlockId) -> Result<BlockId> {
        {
            let state = self.state.read();
            let snap = state.snapshot(snapshot)?;
            if snap.committed {
                return Err(CoreError::IllegalMutation(format!(
                    "snapshot {} is committed",
                    snapshot
                )));
            }
            let meta = state.blocks.get(&id).ok_or_else(|| untracked(&id))?;
            if meta.refs == 1 && meta.epoch == snap.epoch {
                return Ok(id);
            }
        }
        let size = self.store.block_size(&id)?;
        Ok(self.store.allocate(size)?)
    }

    /// Current reference count, `None` for untracked blocks
    pub fn ref_count(&self, id: &BlockId) -> Option<u32> {
        self.state.read().blocks.get(id).map(|meta| meta.refs)
    }

    /// Whether a block is tracked by the allocator
    pub fn is_live(&self, id: &BlockId) -> bool {
        self.state.read().blocks.contains_key(id)
    }

    /// Hold a reference on each block so collection leaves it alone
    pub fn pin(&self, ids: &[BlockId]) -> Result<()> {
        let mut state = self.state.write();
        for (done, id) in ids.iter().enumerate() {
            if let Err(err) = state.incref(id) {
                for pinned in &ids[..done] {
                    state.decref(pinned)?;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release references taken by [`pin`](Self::pin)
    pub fn unpin(&self, ids: &[BlockId]) {
        let mut state = self.state.write();
        for id in ids {
            if let Err(err) = state.decref(id) {
                warn!(%id, error = %err, "unpin of untracked block");
            }
        }
    }

    /// Free blocks a transaction allocated but never published
    pub(crate) fn release_fresh(&self, ids: &[BlockId]) {
        for id in ids {
            if let Err(err) = self.store.free(id) {
                warn!(%id, error = %err, "failed to release unused block");
            }
        }
    }

    /// Rewrite blocks the tree already points at
    ///
    /// On a failed write the images replaced so far are put back, so the
    /// live tree reads as it did before the commit started.
    fn overwrite_live(&self, writes: &[&(BlockId, Block)]) -> Result<()> {
        let mut replaced = Vec::with_capacity(writes.len());
        for (id, block) in writes {
            let outcome = self.store.read(id).and_then(|original| {
                self.store.write(id, block)?;
                Ok(original)
            });
            match outcome {
                Ok(original) => replaced.push((*id, original)),
                Err(err) => {
                    for (id, original) in replaced.iter().rev() {
                        if let Err(undo) = self.store.write(id, original) {
                            warn!(%id, error = %undo, "failed to restore block after a failed commit");
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Publish a transaction: write its blocks, apply reference deltas and
    /// swap the container root
    ///
    /// Fails without side effects when the snapshot was committed or the
    /// container root moved since the transaction started.
    pub(crate) fn apply_commit(
        &self,
        snapshot: SnapshotId,
        ctr: CtrId,
        expected_root: BlockId,
        new_root: BlockId,
        plan: CommitPlan,
    ) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let snap = state.mutable_snapshot(snapshot)?;
        let epoch = snap.epoch;
        let entry = snap
            .directory
            .get(&ctr)
            .ok_or(CoreError::ContainerNotFound(ctr))?;
        if entry.root != expected_root {
            return Err(CoreError::IllegalMutation(format!(
                "root of container {} moved during the transaction",
                ctr
            )));
        }

        // Fresh blocks are unreachable until the root swap, so they go first
        // and a failure there leaves every live block untouched
        let fresh: HashSet<&BlockId> = plan.fresh.iter().collect();
        let (new_blocks, live): (Vec<_>, Vec<_>) =
            plan.writes.iter().partition(|(id, _)| fresh.contains(id));
        for (id, block) in new_blocks {
            self.store.write(id, block)?;
        }
        self.overwrite_live(&live)?;
        for id in &plan.fresh {
            state.blocks.insert(*id, BlockMeta { refs: 0, epoch });
        }
        for id in &plan.increments {
            state.incref(id)?;
        }
        if new_root != expected_root {
            state.incref(&new_root)?;
            if let Some(entry) = state
                .snapshots
                .get_mut(&snapshot)
                .and_then(|meta| meta.directory.get_mut(&ctr))
            {
                entry.root = new_root;
            }
            state.decref(&expected_root)?;
        }
        for id in &plan.decrements {
            state.decref(id)?;
        }
        debug!(
            %snapshot,
            %ctr,
            writes = plan.writes.len(),
            fresh = plan.fresh.len(),
            root = %new_root,
            "applied transaction"
        );
        Ok(())
    }

    pub fn stats(&self) -> AllocStats {
        let state = self.state.read();
        AllocStats {
            snapshots: state.snapshots.len(),
            tracked_blocks: state.blocks.len(),
            pending_blocks: state.pending.len(),
            store: self.store.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{Container, Lookup, Map};
    use std::collections::BTreeMap as Model;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn allocator() -> Arc<Allocator> {
        Allocator::in_memory(EngineConfig::default()).unwrap()
    }

    /// Memory store whose writes start failing once a budget runs out
    struct FailingStore {
        inner: MemoryBlockStore,
        writes_left: AtomicUsize,
    }

    impl FailingStore {
        fn new() -> Self {
            Self {
                inner: MemoryBlockStore::new(),
                writes_left: AtomicUsize::new(usize::MAX),
            }
        }

        fn fail_after(&self, writes: usize) {
            self.writes_left.store(writes, Ordering::SeqCst);
        }

        fn heal(&self) {
            self.writes_left.store(usize::MAX, Ordering::SeqCst);
        }
    }

    impl BlockStore for FailingStore {
        fn allocate(&self, size: usize) -> cowstore_blockstore::Result<BlockId> {
            self.inner.allocate(size)
        }

        fn read(&self, id: &BlockId) -> cowstore_blockstore::Result<Block> {
            self.inner.read(id)
        }

        fn write(&self, id: &BlockId, block: &Block) -> cowstore_blockstore::Result<()> {
            let left = self.writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(BlockStoreError::Io(std::io::Error::other("disk went away")));
            }
            if left != usize::MAX {
                self.writes_left.store(left - 1, Ordering::SeqCst);
            }
            self.inner.write(id, block)
        }

        fn free(&self, id: &BlockId) -> cowstore_blockstore::Result<()> {
            self.inner.free(id)
        }

        fn contains(&self, id: &BlockId) -> bool {
            self.inner.contains(id)
        }

        fn block_size(&self, id: &BlockId) -> cowstore_blockstore::Result<usize> {
            self.inner.block_size(id)
        }

        fn block_ids(&self) -> Vec<BlockId> {
            self.inner.block_ids()
        }

        fn stats(&self) -> StoreStats {
            self.inner.stats()
        }

        fn persist(&self, out: &mut dyn std::io::Write) -> cowstore_blockstore::Result<()> {
            self.inner.persist(out)
        }

        fn load(&self, input: &mut dyn std::io::Read) -> cowstore_blockstore::Result<()> {
            self.inner.load(input)
        }
    }

    #[test]
    fn test_branch_requires_committed_parent() {
        let alloc = allocator();
        let snap = alloc.create_snapshot(Some("base"));
        assert!(matches!(
            snap.branch(None),
            Err(CoreError::SnapshotNotCommitted(_))
        ));
        snap.commit().unwrap();
        let child = snap.branch(Some("child")).unwrap();
        assert_eq!(child.info().unwrap().parent, Some(snap.id()));
    }

    #[test]
    fn test_committed_snapshot_rejects_mutation() {
        let alloc = allocator();
        let snap = alloc.create_snapshot(None);
        let map: Map<u64, u64> = snap.create().unwrap();
        let root = map.tree().root_id().unwrap();
        snap.commit().unwrap();

        assert!(matches!(
            alloc.mutate(snap.id(), root),
            Err(CoreError::IllegalMutation(_))
        ));
    }

    #[test]
    fn test_mutate_copies_shared_blocks() {
        let alloc = allocator();
        let snap = alloc.create_snapshot(None);
        let map: Map<u64, u64> = snap.create().unwrap();
        let root = map.tree().root_id().unwrap();

        // Sole owner, same epoch: in place
        assert_eq!(alloc.mutate(snap.id(), root).unwrap(), root);

        snap.commit().unwrap();
        let child = snap.branch(None).unwrap();
        assert_eq!(alloc.ref_count(&root), Some(2));

        let copy = alloc.mutate(child.id(), root).unwrap();
        assert_ne!(copy, root);
        alloc.release_fresh(&[copy]);
    }

    #[test]
    fn test_drop_snapshot_reparents_children() {
        let alloc = allocator();
        let a = alloc.create_snapshot(Some("a"));
        a.commit().unwrap();
        let b = a.branch(Some("b")).unwrap();
        b.commit().unwrap();
        let c = b.branch(Some("c")).unwrap();

        b.drop_snapshot().unwrap();
        assert_eq!(c.info().unwrap().parent, Some(a.id()));
        assert_eq!(alloc.snapshots().len(), 2);
    }

    #[test]
    fn test_pin_keeps_blocks_alive() {
        let alloc = allocator();
        let snap = alloc.create_snapshot(None);
        let map: Map<u64, u64> = snap.create().unwrap();
        let root = map.tree().root_id().unwrap();

        alloc.pin(&[root]).unwrap();
        snap.clone().drop_snapshot().unwrap();
        assert!(alloc.is_live(&root));
        assert!(map.len().is_err());

        alloc.unpin(&[root]);
        let stats = alloc.gc().unwrap();
        assert_eq!(stats.freed_blocks, 1);
        assert!(!alloc.is_live(&root));
    }

    #[test]
    fn test_failed_block_write_leaves_tree_intact() {
        let store = Arc::new(FailingStore::new());
        let config = EngineConfig::default().with_block_size(256);
        let alloc = Allocator::new(store.clone(), config, Arc::new(TypeRegistry::with_builtin())).unwrap();
        let snap = alloc.create_snapshot(None);
        let mut map: Map<u64, u64> = snap.create().unwrap();
        let mut model = Model::new();
        for key in (0..600u64).step_by(2) {
            map.insert(key, key).unwrap();
            model.insert(key, key);
        }
        assert!(map.tree().height().unwrap() >= 2);

        // An insert rewrites at least the leaf and the root in place, so a
        // budget of one write fails after a live block was already replaced
        let mut failures = 0;
        for (budget, key) in (0..6).zip((1..600u64).step_by(97)) {
            let before = alloc.stats();
            store.fail_after(budget);
            match map.insert(key, key) {
                Ok(_) => {
                    model.insert(key, key);
                }
                Err(err) => {
                    assert!(matches!(err, CoreError::BlockStore(BlockStoreError::Io(_))));
                    assert_eq!(alloc.stats(), before);
                    failures += 1;
                }
            }
            store.heal();
            map.tree().check_invariants().unwrap();
            let entries: Vec<(u64, u64)> = map.iter().unwrap().map(|e| e.unwrap()).collect();
            assert_eq!(entries, model.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>());
        }
        assert!(failures >= 2);

        map.insert(1_001, 1).unwrap();
        assert_eq!(map.get(&1_001).unwrap(), Some(1));
    }
}
