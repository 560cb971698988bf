//! Tree algorithms on top of a transaction
//!
//! Every mutation follows the same pattern: descend with a walker and
//! remember the path, edit the leaf, then walk the path back up. On the way
//! up each level re-summarises the edited child, splits it when it no
//! longer fits its block, merges or refills it from a sibling when it fell
//! below the fill threshold, and drops it when it became empty. At the top
//! a root that split grows a new level and a branch root with a single
//! child is replaced by that child.

use super::node::Node;
use super::txn::Txn;
use super::{Shape, Walker};
use crate::packed::{BranchEntry, Codec, LeafLayout};
use crate::{CoreError, Result};
use cowstore_blockstore::BlockId;
use smallvec::SmallVec;
use std::collections::HashSet;
use tracing::trace;

#[derive(Clone, Copy, Debug)]
pub(crate) struct PathStep {
    pub id: BlockId,
    pub idx: usize,
}

/// Where a descent ended up
#[derive(Clone, Debug)]
pub(crate) struct Descent {
    pub steps: SmallVec<[PathStep; 16]>,
    pub leaf: BlockId,
    pub pos: usize,
}

impl<S: Shape> Txn<'_, S> {
    pub fn descend<W: Walker<S>>(&mut self, root: BlockId, walker: &mut W) -> Result<Descent> {
        let mut steps = SmallVec::new();
        let mut id = root;
        loop {
            match self.load(id)? {
                Node::Branch(entries) => {
                    let idx = walker.branch(entries);
                    let child = entries
                        .get(idx)
                        .map(|e| e.child)
                        .ok_or_else(|| CoreError::corrupt(id, "walker left the branch"))?;
                    steps.push(PathStep { id, idx });
                    id = child;
                }
                Node::Leaf(entries) => {
                    let pos = walker.leaf(entries).min(entries.len());
                    return Ok(Descent {
                        steps,
                        leaf: id,
                        pos,
                    });
                }
            }
        }
    }

    /// Entry at the end of a descent, if the position holds one
    pub fn entry_at(&mut self, descent: &Descent) -> Result<Option<(S::Key, S::Value)>> {
        match self.load(descent.leaf)? {
            Node::Leaf(entries) => Ok(entries.get(descent.pos).cloned()),
            Node::Branch(_) => Err(CoreError::corrupt(descent.leaf, "descent ended on a branch")),
        }
    }

    /// Reject entries that can never fit a block
    pub fn check_entry(&self, key: &S::Key, value: &S::Value) -> Result<()> {
        let size = S::Layout::payload_len(1, S::Layout::entry_len(key, value));
        if size > self.limits.budget {
            return Err(CoreError::PayloadTooLarge {
                size,
                max: self.limits.budget,
            });
        }
        if S::ORDERED {
            let key_len = S::KeyCodec::encoded_len(key);
            if key_len > self.limits.max_key {
                return Err(CoreError::PayloadTooLarge {
                    size: key_len,
                    max: self.limits.max_key,
                });
            }
        }
        Ok(())
    }

    /// Insert before the descent position; returns the new root
    pub fn insert_at(&mut self, descent: &Descent, key: S::Key, value: S::Value) -> Result<BlockId> {
        self.check_entry(&key, &value)?;
        let leaf = self.touch(descent.leaf)?;
        let entries = self.leaf_mut(leaf)?;
        let pos = descent.pos.min(entries.len());
        entries.insert(pos, (key, value));
        let pieces = self.settle(leaf)?;
        self.propagate(&descent.steps, pieces)
    }

    /// Replace the value at the descent position
    pub fn replace_at(&mut self, descent: &Descent, value: S::Value) -> Result<(S::Value, BlockId)> {
        let (key, _) = self
            .entry_at(descent)?
            .ok_or_else(|| CoreError::corrupt(descent.leaf, "no entry at position"))?;
        self.check_entry(&key, &value)?;
        let leaf = self.touch(descent.leaf)?;
        let slot = self
            .leaf_mut(leaf)?
            .get_mut(descent.pos)
            .ok_or_else(|| CoreError::corrupt(leaf, "no entry at position"))?;
        let old = std::mem::replace(&mut slot.1, value);
        let pieces = self.settle(leaf)?;
        Ok((old, self.propagate(&descent.steps, pieces)?))
    }

    /// Remove the entry at the descent position
    pub fn remove_at(&mut self, descent: &Descent) -> Result<((S::Key, S::Value), BlockId)> {
        let leaf = self.touch(descent.leaf)?;
        let entries = self.leaf_mut(leaf)?;
        if descent.pos >= entries.len() {
            return Err(CoreError::corrupt(leaf, "no entry at position"));
        }
        let entry = entries.remove(descent.pos);
        let root = self.propagate(&descent.steps, vec![leaf])?;
        Ok((entry, root))
    }

    /// Append a run of entries at the end of the leaf the descent ended in
    ///
    /// The leaf takes the whole run at once and is cut into bulk-filled
    /// pieces, so the path above it is repaired in a single pass.
    pub fn append_run(&mut self, descent: &Descent, run: Vec<(S::Key, S::Value)>) -> Result<BlockId> {
        for (key, value) in &run {
            self.check_entry(key, value)?;
        }
        let leaf = self.touch(descent.leaf)?;
        self.leaf_mut(leaf)?.extend(run);
        let limits = self.limits;
        let pieces = if self.load(leaf)?.fits(&limits) {
            vec![leaf]
        } else {
            let ranges = self.load(leaf)?.plan_bulk(&limits);
            self.place_pieces(leaf, &ranges)?
        };
        self.propagate(&descent.steps, pieces)
    }

    /// Remove the entries at positions `start..end` and return the new root
    ///
    /// Subtrees lying wholly inside the span are unlinked without being
    /// read. Only the nodes on the two boundary paths are edited, and each
    /// level is repaired once on the way back up.
    pub fn remove_span(&mut self, root: BlockId, start: u64, end: u64) -> Result<BlockId> {
        let root = self.touch(root)?;
        self.remove_below(root, start, end)?;
        let root = self.finish_root(vec![root])?;
        self.mend_seam(root, start)
    }

    /// Refill nodes left underfull along both edges of a removed span
    ///
    /// A boundary node that was the only survivor under its parent has no
    /// sibling to borrow from until a level above merges it next to one,
    /// so the walk starts over from the root after each repair.
    fn mend_seam(&mut self, mut root: BlockId, start: u64) -> Result<BlockId> {
        let limits = self.limits;
        let mut attempted = HashSet::new();
        'walk: loop {
            for edge in [start.saturating_sub(1), start] {
                let (mut id, mut rank) = (root, edge);
                loop {
                    let (idx, child, siblings, skipped) = match self.load(id)? {
                        Node::Leaf(_) => break,
                        Node::Branch(entries) => {
                            let mut skipped = 0u64;
                            let mut idx = entries.len() - 1;
                            for (i, entry) in entries.iter().enumerate() {
                                if rank < skipped + entry.acc.count {
                                    idx = i;
                                    break;
                                }
                                if i + 1 < entries.len() {
                                    skipped += entry.acc.count;
                                }
                            }
                            (idx, entries[idx].child, entries.len(), skipped)
                        }
                    };
                    if siblings >= 2
                        && self.load(child)?.is_underfull(&limits)
                        && attempted.insert(child)
                    {
                        self.rebalance_child(id, idx)?;
                        root = self.finish_root(vec![root])?;
                        continue 'walk;
                    }
                    id = child;
                    rank = rank.saturating_sub(skipped);
                }
            }
            return Ok(root);
        }
    }

    fn remove_below(&mut self, id: BlockId, start: u64, end: u64) -> Result<()> {
        let children = match self.load(id)? {
            Node::Branch(entries) => Some(entries.clone()),
            Node::Leaf(_) => None,
        };
        let Some(children) = children else {
            let entries = self.leaf_mut(id)?;
            let lo = (start as usize).min(entries.len());
            let hi = (end as usize).min(entries.len());
            entries.drain(lo..hi);
            return Ok(());
        };

        let mut kept = Vec::with_capacity(children.len());
        let mut boundaries = Vec::new();
        let mut offset = 0u64;
        for entry in children {
            let (lo, hi) = (offset, offset + entry.acc.count);
            offset = hi;
            if hi <= start || lo >= end {
                kept.push(entry);
            } else if start <= lo && hi <= end {
                trace!(child = %entry.child, entries = entry.acc.count, "unlinked subtree");
            } else {
                let child = self.touch(entry.child)?;
                self.remove_below(child, start.saturating_sub(lo), end.min(hi) - lo)?;
                if self.load(child)?.is_empty() {
                    self.discard(child);
                } else {
                    boundaries.push(kept.len());
                    kept.push(self.summary(child)?);
                }
            }
        }
        *self.branch_mut(id)? = kept;

        // Right boundary first, so merging it leaves the left index valid
        for idx in boundaries.into_iter().rev() {
            if idx < self.branch_mut(id)?.len() {
                self.rebalance_child(id, idx)?;
            }
        }
        Ok(())
    }

    /// Split a touched node that outgrew its block; returns the pieces
    fn settle(&mut self, id: BlockId) -> Result<Vec<BlockId>> {
        let limits = self.limits;
        let node = self.load(id)?;
        if node.fits(&limits) {
            return Ok(vec![id]);
        }
        let mut ranges = node.plan_split(&limits);
        if ranges.len() > 2 {
            // Greedy packing can leave a sliver at the end; the bulk plan folds it
            ranges = node.plan_bulk(&limits);
        }
        self.place_pieces(id, &ranges)
    }

    /// Cut a touched node along `ranges`; the first piece keeps its block
    fn place_pieces(&mut self, id: BlockId, ranges: &[std::ops::Range<usize>]) -> Result<Vec<BlockId>> {
        trace!(node = %id, pieces = ranges.len(), "split node");
        let pieces = self.take(id)?.split_ranges(ranges);
        let mut ids = Vec::with_capacity(pieces.len());
        for (i, piece) in pieces.into_iter().enumerate() {
            if i == 0 {
                *self.node_mut(id)? = piece;
                ids.push(id);
            } else {
                ids.push(self.create(piece)?);
            }
        }
        Ok(ids)
    }

    fn summaries(&mut self, ids: &[BlockId]) -> Result<Vec<BranchEntry<S::Key>>> {
        ids.iter().map(|id| self.summary(*id)).collect()
    }

    /// Carry the pieces of an edited node up the remembered path
    fn propagate(&mut self, steps: &[PathStep], mut pieces: Vec<BlockId>) -> Result<BlockId> {
        for step in steps.iter().rev() {
            let parent = self.touch(step.id)?;
            let mut replacement = Vec::with_capacity(pieces.len());
            for id in &pieces {
                if self.load(*id)?.is_empty() {
                    self.discard(*id);
                } else {
                    replacement.push(self.summary(*id)?);
                }
            }
            let single = replacement.len() == 1;
            self.branch_mut(parent)?
                .splice(step.idx..=step.idx, replacement);
            if single {
                self.rebalance_child(parent, step.idx)?;
            }
            pieces = self.settle(parent)?;
        }
        self.finish_root(pieces)
    }

    /// Merge an underfull child with a neighbour, or share entries with it
    fn rebalance_child(&mut self, parent: BlockId, idx: usize) -> Result<()> {
        let (len, child) = {
            let entries = self.branch_mut(parent)?;
            (entries.len(), entries[idx].child)
        };
        let limits = self.limits;
        if len < 2 || !self.load(child)?.is_underfull(&limits) {
            return Ok(());
        }
        let (l, r) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };
        let (left_id, right_id) = {
            let entries = self.branch_mut(parent)?;
            (entries[l].child, entries[r].child)
        };
        let left = self.touch(left_id)?;
        let right = self.touch(right_id)?;

        let mut merged = self.take(left)?;
        let tail = self.take(right)?;
        merged
            .append(tail)
            .map_err(|_| CoreError::corrupt(right, "siblings at different heights"))?;
        let ranges = merged.plan_split(&limits);

        let mut ids = Vec::with_capacity(ranges.len());
        for (i, piece) in merged.split_ranges(&ranges).into_iter().enumerate() {
            let id = match i {
                0 => left,
                1 => right,
                _ => self.create(Node::empty_leaf())?,
            };
            *self.node_mut(id)? = piece;
            ids.push(id);
        }
        for id in [left, right] {
            if !ids.contains(&id) || self.load(id)?.is_empty() {
                self.discard(id);
                ids.retain(|kept| *kept != id);
            }
        }
        trace!(left = %left, right = %right, kept = ids.len(), "rebalanced siblings");
        let summaries = self.summaries(&ids)?;
        self.branch_mut(parent)?.splice(l..=r, summaries);
        Ok(())
    }

    /// Grow or shrink the tree at the top and return the final root
    fn finish_root(&mut self, mut pieces: Vec<BlockId>) -> Result<BlockId> {
        while pieces.len() > 1 {
            let summaries = self.summaries(&pieces)?;
            let root = self.create(Node::Branch(summaries))?;
            pieces = self.settle(root)?;
        }
        let mut root = pieces
            .first()
            .copied()
            .ok_or_else(|| CoreError::InvariantViolation("tree lost its root".to_string()))?;
        loop {
            let next = match self.load(root)? {
                Node::Branch(entries) if entries.len() == 1 => Some(entries[0].child),
                Node::Branch(entries) if entries.is_empty() => None,
                _ => return Ok(root),
            };
            self.discard(root);
            root = match next {
                Some(child) => child,
                None => return self.create(Node::empty_leaf()),
            };
        }
    }

    /// Build a complete tree from entries already in order
    pub fn build(&mut self, entries: Vec<(S::Key, S::Value)>) -> Result<BlockId> {
        for (key, value) in &entries {
            self.check_entry(key, value)?;
        }
        let mut level = Node::<S>::Leaf(entries);
        loop {
            if level.is_empty() {
                return self.create(Node::empty_leaf());
            }
            let ranges = level.plan_bulk(&self.limits);
            let mut ids = Vec::with_capacity(ranges.len());
            for piece in level.split_ranges(&ranges) {
                ids.push(self.create(piece)?);
            }
            if ids.len() == 1 {
                return Ok(ids[0]);
            }
            level = Node::Branch(self.summaries(&ids)?);
        }
    }
}
