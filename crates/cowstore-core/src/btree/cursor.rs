//! Cursors and entry iteration
//!
//! A cursor remembers the branches on its path and the leaf it stands in,
//! and pins all of them. Pinned blocks carry an extra reference, so writers
//! copy them instead of rewriting them in place and collection leaves them
//! alone: the cursor keeps reading the version it was created on. Blocks
//! off the path are read when the cursor gets there, so entries written in
//! the meantime may or may not be observed.

use super::node::Node;
use super::walker::{Edge, EdgeWalker};
use super::{Shape, Walker};
use crate::alloc::Allocator;
use crate::packed::{Accumulator, BranchEntry};
use crate::{CoreError, Result};
use cowstore_blockstore::BlockId;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

struct Frame<K> {
    id: BlockId,
    entries: Vec<BranchEntry<K>>,
    idx: usize,
}

pub struct Cursor<S: Shape> {
    alloc: Arc<Allocator>,
    type_hash: u64,
    path: SmallVec<[Frame<S::Key>; 16]>,
    leaf_id: BlockId,
    leaf: Vec<(S::Key, S::Value)>,
    pos: usize,
    /// Aggregate of all leaves before the current one
    base: Accumulator,
    pinned: Vec<BlockId>,
}

impl<S: Shape> fmt::Debug for Cursor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("leaf", &self.leaf_id)
            .field("pos", &self.pos)
            .field("position", &self.position())
            .finish()
    }
}

impl<S: Shape> Cursor<S> {
    pub(crate) fn seek<W: Walker<S>>(
        alloc: Arc<Allocator>,
        type_hash: u64,
        root: BlockId,
        mut walker: W,
    ) -> Result<Self> {
        let mut cursor = Self {
            alloc,
            type_hash,
            path: SmallVec::new(),
            leaf_id: root,
            leaf: Vec::new(),
            pos: 0,
            base: Accumulator::ZERO,
            pinned: Vec::new(),
        };
        cursor.descend(root, &mut walker)?;
        cursor.repin()?;
        if cursor.pos >= cursor.leaf.len() {
            // Land on the next entry when the walker stopped past a leaf's end
            cursor.next_leaf()?;
        }
        Ok(cursor)
    }

    fn load(&self, id: &BlockId) -> Result<Node<S>> {
        let block = self.alloc.read_block(id)?;
        Node::decode(id, &block, self.type_hash)
    }

    /// Walk down from `id`, extending the path and accumulating the base
    fn descend<W: Walker<S>>(&mut self, mut id: BlockId, walker: &mut W) -> Result<()> {
        loop {
            match self.load(&id)? {
                Node::Branch(entries) => {
                    let idx = walker.branch(&entries);
                    let child = entries
                        .get(idx)
                        .map(|e| e.child)
                        .ok_or_else(|| CoreError::corrupt(id, "walker left the branch"))?;
                    self.base += entries[..idx].iter().map(|e| e.acc).sum::<Accumulator>();
                    self.path.push(Frame { id, entries, idx });
                    id = child;
                }
                Node::Leaf(entries) => {
                    self.pos = walker.leaf(&entries).min(entries.len());
                    self.leaf = entries;
                    self.leaf_id = id;
                    return Ok(());
                }
            }
        }
    }

    /// Pin the current path and release the previous one
    fn repin(&mut self) -> Result<()> {
        let mut ids: Vec<BlockId> = self.path.iter().map(|f| f.id).collect();
        ids.push(self.leaf_id);
        self.alloc.pin(&ids)?;
        let old = std::mem::replace(&mut self.pinned, ids);
        self.alloc.unpin(&old);
        Ok(())
    }

    fn leaf_acc(&self) -> Accumulator {
        Accumulator::new(self.leaf.len() as u64, S::leaf_rank(&self.leaf, self.leaf.len()))
    }

    /// Whether the cursor stands past the last entry
    pub fn is_end(&self) -> bool {
        self.pos >= self.leaf.len()
    }

    /// Rank of the current entry (the total count at the end)
    pub fn position(&self) -> u64 {
        self.base.count + self.pos as u64
    }

    /// Total weight of all entries before the current one
    pub fn prefix_weight(&self) -> u64 {
        self.base.weight + S::leaf_rank(&self.leaf, self.pos)
    }

    pub fn key(&self) -> Option<&S::Key> {
        self.leaf.get(self.pos).map(|(k, _)| k)
    }

    pub fn value(&self) -> Option<&S::Value> {
        self.leaf.get(self.pos).map(|(_, v)| v)
    }

    pub fn entry(&self) -> Option<(&S::Key, &S::Value)> {
        self.leaf.get(self.pos).map(|(k, v)| (k, v))
    }

    /// Step to the next entry; false once past the end
    pub fn next_entry(&mut self) -> Result<bool> {
        if self.is_end() {
            return Ok(false);
        }
        self.pos += 1;
        if self.pos >= self.leaf.len() {
            return self.next_leaf();
        }
        Ok(true)
    }

    /// Step to the previous entry; false when already at the first
    pub fn prev_entry(&mut self) -> Result<bool> {
        if self.pos > 0 {
            self.pos -= 1;
            return Ok(true);
        }
        self.prev_leaf()
    }

    /// Move to the first entry of the next leaf; false past the last leaf
    pub fn next_leaf(&mut self) -> Result<bool> {
        let Some(depth) = self
            .path
            .iter()
            .rposition(|frame| frame.idx + 1 < frame.entries.len())
        else {
            self.pos = self.leaf.len();
            return Ok(false);
        };
        let next_base = self.base + self.leaf_acc();
        self.path.truncate(depth + 1);
        let frame = &mut self.path[depth];
        frame.idx += 1;
        let child = frame.entries[frame.idx].child;

        self.base = next_base;
        self.descend(child, &mut EdgeWalker(Edge::First))?;
        self.repin()?;
        Ok(!self.is_end())
    }

    /// Move to the last entry of the previous leaf; false at the first leaf
    pub fn prev_leaf(&mut self) -> Result<bool> {
        let Some(depth) = self.path.iter().rposition(|frame| frame.idx > 0) else {
            return Ok(false);
        };
        self.path.truncate(depth + 1);
        let frame = &mut self.path[depth];
        frame.idx -= 1;
        let child = frame.entries[frame.idx].child;
        let skipped = frame.entries[frame.idx].acc;

        // Everything in `child` precedes the current leaf; descending to its
        // rightmost leaf adds back all but that leaf
        self.base -= skipped;
        self.descend(child, &mut EdgeWalker(Edge::Last))?;
        self.repin()?;
        Ok(!self.is_end())
    }
}

impl<S: Shape> Drop for Cursor<S> {
    fn drop(&mut self) {
        let pinned = std::mem::take(&mut self.pinned);
        self.alloc.unpin(&pinned);
    }
}

/// Iterator over entries starting at a cursor
pub struct Entries<S: Shape> {
    cursor: Cursor<S>,
    remaining: Option<u64>,
    started: bool,
}

impl<S: Shape> Entries<S> {
    pub fn new(cursor: Cursor<S>) -> Self {
        Self {
            cursor,
            remaining: None,
            started: false,
        }
    }

    /// Stop after `limit` entries
    pub fn limited(cursor: Cursor<S>, limit: u64) -> Self {
        Self {
            cursor,
            remaining: Some(limit),
            started: false,
        }
    }
}

impl<S: Shape> Iterator for Entries<S> {
    type Item = Result<(S::Key, S::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.started {
            match self.cursor.next_entry() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.remaining = Some(0);
                    return Some(Err(err));
                }
            }
        }
        self.started = true;
        let (key, value) = self.cursor.entry()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(Ok((key.clone(), value.clone())))
    }
}
