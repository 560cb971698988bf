//! A container's tree inside one snapshot

use super::cursor::{Cursor, Entries};
use super::node::{Node, NodeLimits};
use super::txn::Txn;
use super::walker::{Bound, Edge, EdgeWalker, KeyWalker, RankWalker};
use super::{Shape, Walker};
use crate::alloc::{Allocator, CtrId, SnapshotId};
use crate::packed::Accumulator;
use crate::registry::Signature;
use crate::{CoreError, Result};
use cowstore_blockstore::BlockId;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument};

/// What a keyed insert does when the key is already present
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Duplicates {
    /// Overwrite the stored value
    Replace,
    /// Leave the stored entry alone
    Keep,
    /// Add another entry after the existing ones
    Append,
}

/// Result of a read-only descent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe<K, V> {
    /// Rank of the position the walker chose
    pub position: u64,
    /// Total weight of the entries before that position
    pub prefix_weight: u64,
    /// Entry at the position, `None` at the end
    pub entry: Option<(K, V)>,
}

/// Figures gathered by [`Tree::check_invariants`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub branches: usize,
    pub leaves: usize,
    pub entries: u64,
    pub total_weight: u64,
}

/// Handle to one container tree in one snapshot
///
/// The handle holds no node data. Every read starts at the root currently
/// recorded in the snapshot directory, and every write runs as a single
/// transaction that ends by swapping that root.
pub struct Tree<S: Shape> {
    alloc: Arc<Allocator>,
    snapshot: SnapshotId,
    ctr: CtrId,
    signature: Signature,
    limits: NodeLimits,
    _shape: PhantomData<fn() -> S>,
}

impl<S: Shape> Clone for Tree<S> {
    fn clone(&self) -> Self {
        Self {
            alloc: self.alloc.clone(),
            snapshot: self.snapshot,
            ctr: self.ctr,
            signature: self.signature.clone(),
            limits: self.limits,
            _shape: PhantomData,
        }
    }
}

impl<S: Shape> fmt::Debug for Tree<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("snapshot", &self.snapshot)
            .field("ctr", &self.ctr)
            .field("signature", &self.signature)
            .finish()
    }
}

impl<S: Shape> Tree<S> {
    fn new(alloc: Arc<Allocator>, snapshot: SnapshotId, ctr: CtrId, signature: Signature) -> Self {
        let limits = NodeLimits::from_config(alloc.config());
        Self {
            alloc,
            snapshot,
            ctr,
            signature,
            limits,
            _shape: PhantomData,
        }
    }

    /// Add an empty container to a mutable snapshot
    ///
    /// The shape's signature must be registered with the allocator's
    /// registry.
    pub(crate) fn create(alloc: Arc<Allocator>, snapshot: SnapshotId, ctr: CtrId) -> Result<Self> {
        let signature = alloc.registry().require(&S::signature())?;
        let epoch = alloc.snapshot_epoch(snapshot)?;
        let block = Node::<S>::empty_leaf().encode(signature.type_hash(), epoch);
        alloc.create_container(snapshot, ctr, signature.clone(), &block)?;
        Ok(Self::new(alloc, snapshot, ctr, signature))
    }

    /// Open an existing container, checking that it was created as `S`
    pub(crate) fn open(alloc: Arc<Allocator>, snapshot: SnapshotId, ctr: CtrId) -> Result<Self> {
        let (_, signature) = alloc.container_root(snapshot, ctr)?;
        let expected = S::signature();
        if signature.as_str() != expected {
            return Err(CoreError::SignatureMismatch {
                expected,
                actual: signature.as_str().to_string(),
            });
        }
        Ok(Self::new(alloc, snapshot, ctr, signature))
    }

    pub fn ctr(&self) -> CtrId {
        self.ctr
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Block currently holding the root node
    pub fn root_id(&self) -> Result<BlockId> {
        self.alloc
            .container_root(self.snapshot, self.ctr)
            .map(|(root, _)| root)
    }

    fn load(&self, id: &BlockId) -> Result<Node<S>> {
        let block = self.alloc.read_block(id)?;
        Node::decode(id, &block, self.signature.type_hash())
    }

    /// Aggregate over the whole tree
    pub fn summary(&self) -> Result<Accumulator> {
        self.load(&self.root_id()?)?.accumulator()
    }

    /// Number of entries
    pub fn len(&self) -> Result<u64> {
        Ok(self.summary()?.count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sum of all entry weights
    pub fn total_weight(&self) -> Result<u64> {
        Ok(self.summary()?.weight)
    }

    /// Levels from the root to the leaves; a lone leaf root has height 1
    pub fn height(&self) -> Result<usize> {
        let mut id = self.root_id()?;
        let mut height = 1;
        while let Node::Branch(entries) = self.load(&id)? {
            id = entries[0].child;
            height += 1;
        }
        Ok(height)
    }

    /// Position a pinned cursor with `walker`
    ///
    /// An empty tree yields a cursor that is already at the end.
    pub fn find<W: Walker<S>>(&self, walker: W) -> Result<Cursor<S>> {
        Cursor::seek(
            self.alloc.clone(),
            self.signature.type_hash(),
            self.root_id()?,
            walker,
        )
    }

    /// Descend with `walker` without pinning anything
    pub fn probe<W: Walker<S>>(&self, mut walker: W) -> Result<Probe<S::Key, S::Value>> {
        let mut prefix = Accumulator::ZERO;
        let mut id = self.root_id()?;
        loop {
            match self.load(&id)? {
                Node::Branch(entries) => {
                    let idx = walker.branch(&entries);
                    let child = entries
                        .get(idx)
                        .map(|e| e.child)
                        .ok_or_else(|| CoreError::corrupt(id, "walker left the branch"))?;
                    prefix += entries[..idx].iter().map(|e| e.acc).sum::<Accumulator>();
                    id = child;
                }
                Node::Leaf(mut entries) => {
                    let pos = walker.leaf(&entries).min(entries.len());
                    let weight = S::leaf_rank(&entries, pos);
                    let entry = (pos < entries.len()).then(|| entries.swap_remove(pos));
                    return Ok(Probe {
                        position: prefix.count + pos as u64,
                        prefix_weight: prefix.weight + weight,
                        entry,
                    });
                }
            }
        }
    }

    /// Entry stored under `key`, the first one when keys repeat
    pub fn get_by_key(&self, key: &S::Key) -> Result<Option<(u64, S::Value)>> {
        let probe = self.probe(KeyWalker::<S>::lower(key))?;
        Ok(match probe.entry {
            Some((found, value)) if &found == key => Some((probe.position, value)),
            _ => None,
        })
    }

    /// Number of entries ordered before `key`
    pub fn rank_of_key(&self, key: &S::Key, bound: Bound) -> Result<u64> {
        Ok(self.probe(KeyWalker::<S>::new(key, bound))?.position)
    }

    /// Entry at `position`
    pub fn get_at(&self, position: u64) -> Result<Option<(S::Key, S::Value)>> {
        if position >= self.len()? {
            return Ok(None);
        }
        Ok(self.probe(RankWalker::new(position))?.entry)
    }

    /// Iterate over every entry from the first
    pub fn iter(&self) -> Result<Entries<S>> {
        Ok(Entries::new(self.find(EdgeWalker(Edge::First))?))
    }

    /// Iterate over the entries at positions `start..end`
    pub fn iter_range(&self, start: u64, end: u64) -> Result<Entries<S>> {
        let cursor = self.find(RankWalker::new(start))?;
        Ok(Entries::limited(cursor, end.saturating_sub(start)))
    }

    fn check_position(&self, position: u64, len: u64) -> Result<()> {
        if position >= len {
            return Err(CoreError::IndexOutOfBounds {
                index: position,
                len,
            });
        }
        Ok(())
    }

    /// Run `op` in a transaction and publish it
    ///
    /// `op` gets the transaction and the current root and returns its
    /// result together with the new root, or `None` when it changed
    /// nothing. Errors and no-op results leave the container as it was.
    fn write<R>(
        &self,
        op: impl FnOnce(&mut Txn<'_, S>, BlockId) -> Result<(R, Option<BlockId>)>,
    ) -> Result<R> {
        let root = self.root_id()?;
        let mut txn = Txn::begin(
            &self.alloc,
            self.snapshot,
            self.signature.type_hash(),
            self.limits,
        )?;
        // Every aggregate in the tree is bounded by the root's, so a root
        // total that fits in a u64 keeps all later reads in range
        let outcome = op(&mut txn, root).and_then(|(out, new_root)| {
            if let Some(new_root) = new_root {
                txn.load(new_root)?.accumulator()?;
            }
            Ok((out, new_root))
        });
        match outcome {
            Ok((out, Some(new_root))) => {
                txn.commit(self.ctr, root, new_root)?;
                if self.alloc.config().auto_gc {
                    self.alloc.gc()?;
                }
                Ok(out)
            }
            Ok((out, None)) => {
                txn.abort();
                Ok(out)
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Insert into an ordered tree, handling an existing key per `policy`
    ///
    /// Returns the value that was stored under the key before, if any. With
    /// [`Duplicates::Append`] nothing is replaced and the result is `None`.
    #[instrument(skip(self, key, value), fields(ctr = %self.ctr))]
    pub fn insert_by_key(
        &self,
        key: S::Key,
        value: S::Value,
        policy: Duplicates,
    ) -> Result<Option<S::Value>> {
        self.write(|txn, root| {
            let bound = match policy {
                Duplicates::Append => Bound::Upper,
                Duplicates::Replace | Duplicates::Keep => Bound::Lower,
            };
            let descent = txn.descend(root, &mut KeyWalker::<S>::new(&key, bound))?;
            if policy != Duplicates::Append {
                if let Some((found, old)) = txn.entry_at(&descent)? {
                    if found == key {
                        if policy == Duplicates::Keep {
                            return Ok((Some(old), None));
                        }
                        let (old, root) = txn.replace_at(&descent, value)?;
                        return Ok((Some(old), Some(root)));
                    }
                }
            }
            let root = txn.insert_at(&descent, key, value)?;
            Ok((None, Some(root)))
        })
    }

    /// Remove the first entry stored under `key`
    #[instrument(skip(self, key), fields(ctr = %self.ctr))]
    pub fn remove_by_key(&self, key: &S::Key) -> Result<Option<(S::Key, S::Value)>> {
        self.write(|txn, root| {
            let descent = txn.descend(root, &mut KeyWalker::<S>::lower(key))?;
            match txn.entry_at(&descent)? {
                Some((found, _)) if &found == key => {
                    let (entry, root) = txn.remove_at(&descent)?;
                    Ok((Some(entry), Some(root)))
                }
                _ => Ok((None, None)),
            }
        })
    }

    /// Remove every entry stored under `key`; returns how many there were
    #[instrument(skip(self, key), fields(ctr = %self.ctr))]
    pub fn remove_all_by_key(&self, key: &S::Key) -> Result<u64> {
        let start = self.rank_of_key(key, Bound::Lower)?;
        let end = self.rank_of_key(key, Bound::Upper)?;
        self.remove_range(start, end)
    }

    /// Insert before `position`; `position == len` appends
    ///
    /// Positional inserts do not look at keys, so ordered trees stay sorted
    /// only if the caller picks a matching position.
    #[instrument(skip(self, key, value), fields(ctr = %self.ctr))]
    pub fn insert_at(&self, position: u64, key: S::Key, value: S::Value) -> Result<()> {
        let len = self.len()?;
        if position > len {
            return Err(CoreError::IndexOutOfBounds {
                index: position,
                len,
            });
        }
        self.write(|txn, root| {
            let descent = txn.descend(root, &mut RankWalker::new(position))?;
            let root = txn.insert_at(&descent, key, value)?;
            Ok(((), Some(root)))
        })
    }

    /// Replace the value at `position`, returning the old one
    #[instrument(skip(self, value), fields(ctr = %self.ctr))]
    pub fn update_at(&self, position: u64, value: S::Value) -> Result<S::Value> {
        self.check_position(position, self.len()?)?;
        self.write(|txn, root| {
            let descent = txn.descend(root, &mut RankWalker::new(position))?;
            let (old, root) = txn.replace_at(&descent, value)?;
            Ok((old, Some(root)))
        })
    }

    /// Remove the entry at `position`
    #[instrument(skip(self), fields(ctr = %self.ctr))]
    pub fn remove_at(&self, position: u64) -> Result<(S::Key, S::Value)> {
        self.check_position(position, self.len()?)?;
        self.write(|txn, root| {
            let descent = txn.descend(root, &mut RankWalker::new(position))?;
            let (entry, root) = txn.remove_at(&descent)?;
            Ok((entry, Some(root)))
        })
    }

    /// Remove the entries at positions `start..end` in one transaction
    ///
    /// Subtrees inside the range are unlinked whole and only the two
    /// boundary paths are rewritten. Returns the number removed.
    #[instrument(skip(self), fields(ctr = %self.ctr))]
    pub fn remove_range(&self, start: u64, end: u64) -> Result<u64> {
        let len = self.len()?;
        let end = end.min(len);
        if start >= end {
            return Ok(0);
        }
        if start == 0 && end == len {
            self.bulk_load(Vec::new())?;
            return Ok(len);
        }
        self.write(|txn, root| {
            let root = txn.remove_span(root, start, end)?;
            Ok((end - start, Some(root)))
        })
    }

    /// Replace the whole contents with `entries`, packed bottom-up
    ///
    /// Ordered trees require the entries sorted by key.
    #[instrument(skip(self, entries), fields(ctr = %self.ctr, entries = entries.len()))]
    pub fn bulk_load(&self, entries: Vec<(S::Key, S::Value)>) -> Result<()> {
        if S::ORDERED && entries.windows(2).any(|pair| pair[0].0 > pair[1].0) {
            return Err(CoreError::InvalidArgument(
                "bulk load entries are not sorted by key".to_string(),
            ));
        }
        self.write(|txn, _| {
            let root = txn.build(entries)?;
            Ok(((), Some(root)))
        })?;
        debug!(ctr = %self.ctr, "bulk loaded");
        Ok(())
    }

    /// Append `entries` after the last entry in one transaction
    ///
    /// Ordered trees require the entries sorted and not below the current
    /// last key.
    #[instrument(skip(self, entries), fields(ctr = %self.ctr))]
    pub fn extend(&self, entries: impl IntoIterator<Item = (S::Key, S::Value)>) -> Result<u64> {
        let entries: Vec<_> = entries.into_iter().collect();
        if entries.is_empty() {
            return Ok(0);
        }
        if S::ORDERED {
            let last = self.probe(EdgeWalker(Edge::Last))?.entry.map(|(k, _)| k);
            let mut previous = last.as_ref();
            for (key, _) in &entries {
                if previous.is_some_and(|p| p > key) {
                    return Err(CoreError::InvalidArgument(
                        "extend entries must not sort before existing keys".to_string(),
                    ));
                }
                previous = Some(key);
            }
        }
        let count = entries.len() as u64;
        self.write(|txn, root| {
            let descent = txn.descend(root, &mut EdgeWalker(Edge::End))?;
            let root = txn.append_run(&descent, entries)?;
            Ok((count, Some(root)))
        })
    }

    /// Walk every node and verify the structural invariants
    ///
    /// Checks that all leaves sit at the same depth, that branch aggregates
    /// and separators match their children, that keys of ordered trees are
    /// sorted, that every node fits its block and that every block is live.
    pub fn check_invariants(&self) -> Result<TreeStats> {
        let root = self.root_id()?;
        let mut stats = TreeStats::default();
        let mut leaf_depth = None;
        let mut last_key: Option<S::Key> = None;
        // Depth-first, left to right
        let mut stack = vec![(root, 1usize)];
        while let Some((id, depth)) = stack.pop() {
            if !matches!(self.alloc.ref_count(&id), Some(refs) if refs > 0) {
                return Err(violation(format!("block {} is not referenced", id)));
            }
            let node = self.load(&id)?;
            if !node.fits(&self.limits) {
                return Err(violation(format!("node {} exceeds its block", id)));
            }
            if id != root && node.is_empty() {
                return Err(violation(format!("non-root node {} is empty", id)));
            }
            match node {
                Node::Branch(entries) => {
                    stats.branches += 1;
                    for entry in entries.iter().rev() {
                        let child = self.load(&entry.child)?;
                        if child.accumulator()? != entry.acc {
                            return Err(violation(format!(
                                "aggregate for child {} of {} is stale",
                                entry.child, id
                            )));
                        }
                        if child.max_key() != Some(&entry.key) {
                            return Err(violation(format!(
                                "separator for child {} of {} is stale",
                                entry.child, id
                            )));
                        }
                        stack.push((entry.child, depth + 1));
                    }
                }
                Node::Leaf(entries) => {
                    stats.leaves += 1;
                    match leaf_depth {
                        None => leaf_depth = Some(depth),
                        Some(expected) if expected != depth => {
                            return Err(violation(format!(
                                "leaf {} at depth {} but others at {}",
                                id, depth, expected
                            )));
                        }
                        Some(_) => {}
                    }
                    stats.entries += entries.len() as u64;
                    stats.total_weight = stats
                        .total_weight
                        .saturating_add(S::leaf_rank(&entries, entries.len()));
                    if S::ORDERED {
                        for (key, _) in entries {
                            if last_key.as_ref().is_some_and(|last| last > &key) {
                                return Err(violation(format!("keys out of order in leaf {}", id)));
                            }
                            last_key = Some(key);
                        }
                    }
                }
            }
        }
        stats.height = leaf_depth.unwrap_or(1);
        Ok(stats)
    }
}

fn violation(message: String) -> CoreError {
    CoreError::InvariantViolation(message)
}
