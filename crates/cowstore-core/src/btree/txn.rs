//! Write transactions over one container tree
//!
//! A transaction works in two phases. First every change is made to decoded
//! nodes held in memory: nodes are touched (opened for writing, which asks
//! the allocator whether to write in place or into a fresh block), edited,
//! split and merged. Nothing reaches the store in this phase, so any error,
//! including `OutOfSpace` from a fresh allocation or `PayloadTooLarge`,
//! leaves the container unchanged.
//!
//! Then [`Txn::commit`] encodes the dirty nodes, works out reference count
//! changes and hands everything to the allocator, which publishes it under
//! a single lock together with the new root.

use super::node::{Node, NodeLimits};
use super::Shape;
use crate::alloc::{Allocator, CommitPlan, CtrId, SnapshotId};
use crate::packed::BranchEntry;
use crate::{CoreError, Result};
use cowstore_blockstore::BlockId;
use std::collections::{HashMap, HashSet};
use tracing::trace;

struct Dirty<S: Shape> {
    node: Node<S>,
    /// Children of the stored version when the block is rewritten in place
    stored_children: Option<Vec<BlockId>>,
}

pub(crate) struct Txn<'a, S: Shape> {
    alloc: &'a Allocator,
    snapshot: SnapshotId,
    epoch: u64,
    type_hash: u64,
    pub(crate) limits: NodeLimits,
    clean: HashMap<BlockId, Node<S>>,
    dirty: HashMap<BlockId, Dirty<S>>,
    fresh: HashSet<BlockId>,
}

impl<'a, S: Shape> Txn<'a, S> {
    /// Start a transaction; fails if the snapshot is not mutable
    pub fn begin(
        alloc: &'a Allocator,
        snapshot: SnapshotId,
        type_hash: u64,
        limits: NodeLimits,
    ) -> Result<Self> {
        let epoch = alloc.snapshot_epoch(snapshot)?;
        Ok(Self {
            alloc,
            snapshot,
            epoch,
            type_hash,
            limits,
            clean: HashMap::new(),
            dirty: HashMap::new(),
            fresh: HashSet::new(),
        })
    }

    /// Current content of a node, including uncommitted edits
    pub fn load(&mut self, id: BlockId) -> Result<&Node<S>> {
        if self.dirty.contains_key(&id) {
            return self
                .dirty
                .get(&id)
                .map(|d| &d.node)
                .ok_or_else(|| not_writable(&id));
        }
        if !self.clean.contains_key(&id) {
            let block = self.alloc.read_block(&id)?;
            let node = Node::decode(&id, &block, self.type_hash)?;
            self.clean.insert(id, node);
        }
        self.clean.get(&id).ok_or_else(|| not_writable(&id))
    }

    /// Open a node for writing and return the id it will be written under
    pub fn touch(&mut self, id: BlockId) -> Result<BlockId> {
        if self.dirty.contains_key(&id) {
            return Ok(id);
        }
        self.load(id)?;
        let node = self.clean.remove(&id).ok_or_else(|| not_writable(&id))?;
        let target = match self.alloc.mutate(self.snapshot, id) {
            Ok(target) => target,
            Err(err) => {
                self.clean.insert(id, node);
                return Err(err);
            }
        };
        let stored_children = if target == id {
            Some(node.child_ids())
        } else {
            trace!(from = %id, to = %target, "copy on write");
            self.fresh.insert(target);
            // The original stays readable for later loads in this transaction
            self.clean.insert(id, node.clone());
            None
        };
        self.dirty.insert(
            target,
            Dirty {
                node,
                stored_children,
            },
        );
        Ok(target)
    }

    /// Add a new node in a fresh block
    pub fn create(&mut self, node: Node<S>) -> Result<BlockId> {
        let id = self.alloc.allocate_block()?;
        self.fresh.insert(id);
        self.dirty.insert(
            id,
            Dirty {
                node,
                stored_children: None,
            },
        );
        Ok(id)
    }

    /// Drop a node from the tree; its block is released on commit
    pub fn discard(&mut self, id: BlockId) {
        self.dirty.remove(&id);
        self.clean.remove(&id);
    }

    pub fn node_mut(&mut self, id: BlockId) -> Result<&mut Node<S>> {
        self.dirty
            .get_mut(&id)
            .map(|d| &mut d.node)
            .ok_or_else(|| not_writable(&id))
    }

    /// Take the entries out of a touched node, leaving it empty
    pub fn take(&mut self, id: BlockId) -> Result<Node<S>> {
        let node = self.node_mut(id)?;
        let empty = match node {
            Node::Branch(_) => Node::Branch(Vec::new()),
            Node::Leaf(_) => Node::Leaf(Vec::new()),
        };
        Ok(std::mem::replace(node, empty))
    }

    pub fn branch_mut(&mut self, id: BlockId) -> Result<&mut Vec<BranchEntry<S::Key>>> {
        match self.node_mut(id)? {
            Node::Branch(entries) => Ok(entries),
            Node::Leaf(_) => Err(CoreError::corrupt(id, "expected a branch, found a leaf")),
        }
    }

    pub fn leaf_mut(&mut self, id: BlockId) -> Result<&mut Vec<(S::Key, S::Value)>> {
        match self.node_mut(id)? {
            Node::Leaf(entries) => Ok(entries),
            Node::Branch(_) => Err(CoreError::corrupt(id, "expected a leaf, found a branch")),
        }
    }

    /// Branch entry describing a node to its parent
    pub fn summary(&mut self, id: BlockId) -> Result<BranchEntry<S::Key>> {
        let node = self.load(id)?;
        let key = node
            .max_key()
            .cloned()
            .ok_or_else(|| CoreError::InvariantViolation(format!("empty node {} has no separator", id)))?;
        Ok(BranchEntry::new(key, id, node.accumulator()?))
    }

    /// Publish all changes and make `new_root` the container's root
    pub fn commit(mut self, ctr: CtrId, old_root: BlockId, new_root: BlockId) -> Result<()> {
        let published = self.plan().and_then(|plan| {
            self.alloc
                .apply_commit(self.snapshot, ctr, old_root, new_root, plan)
        });
        if let Err(err) = published {
            self.abort();
            return Err(err);
        }
        let unused: Vec<BlockId> = self
            .fresh
            .iter()
            .filter(|id| !self.dirty.contains_key(id))
            .copied()
            .collect();
        self.alloc.release_fresh(&unused);
        Ok(())
    }

    /// Encode dirty nodes and work out reference count changes
    ///
    /// A node rewritten in place changes references by the difference
    /// between its stored and new children; a node in a fresh block
    /// references all of its children for the first time.
    fn plan(&self) -> Result<CommitPlan> {
        let mut plan = CommitPlan::default();
        for (id, dirty) in &self.dirty {
            let block = dirty.node.encode(self.type_hash, self.epoch);
            if block.payload.len() > self.limits.budget {
                return Err(CoreError::NodeFull {
                    size: block.payload.len(),
                    budget: self.limits.budget,
                });
            }
            let children = dirty.node.child_ids();
            match &dirty.stored_children {
                Some(stored) => {
                    let before: HashSet<&BlockId> = stored.iter().collect();
                    let after: HashSet<&BlockId> = children.iter().collect();
                    plan.increments
                        .extend(children.iter().filter(|c| !before.contains(c)));
                    plan.decrements
                        .extend(stored.iter().filter(|c| !after.contains(c)));
                }
                None => plan.increments.extend(children.iter()),
            }
            if self.fresh.contains(id) {
                plan.fresh.push(*id);
            }
            plan.writes.push((*id, block));
        }
        Ok(plan)
    }

    /// Throw away all changes and release the fresh blocks
    pub fn abort(&mut self) {
        let fresh: Vec<BlockId> = self.fresh.drain().collect();
        self.alloc.release_fresh(&fresh);
        self.dirty.clear();
    }
}

fn not_writable(id: &BlockId) -> CoreError {
    CoreError::IllegalMutation(format!("block {} is not open in this transaction", id))
}
