//! Decoded B-tree nodes
//!
//! A node is either a branch (separator keys, child ids and per-child
//! aggregates) or a leaf (entries in the shape's leaf layout). Nodes are
//! decoded from and encoded to whole blocks; every size check goes through
//! the same packed layouts that produce the final payload.

use super::Shape;
use crate::config::EngineConfig;
use crate::packed::{branch, Accumulator, BranchEntry, LeafLayout};
use crate::{CoreError, Result};
use bytes::BytesMut;
use cowstore_blockstore::{Block, BlockHeader, BlockId, BlockKind};
use std::fmt;
use std::ops::Range;

/// Size limits applied to every node of a tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLimits {
    pub budget: usize,
    pub max_fanout: usize,
    pub min_fill: usize,
    pub bulk_fill: usize,
    pub max_key: usize,
}

impl NodeLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            budget: config.node_budget(),
            max_fanout: config.max_fanout,
            min_fill: config.min_fill_bytes(),
            bulk_fill: config.bulk_fill_bytes(),
            max_key: config.max_key_len(),
        }
    }
}

pub enum Node<S: Shape> {
    Branch(Vec<BranchEntry<S::Key>>),
    Leaf(Vec<(S::Key, S::Value)>),
}

impl<S: Shape> Clone for Node<S> {
    fn clone(&self) -> Self {
        match self {
            Node::Branch(entries) => Node::Branch(entries.clone()),
            Node::Leaf(entries) => Node::Leaf(entries.clone()),
        }
    }
}

impl<S: Shape> fmt::Debug for Node<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Branch(entries) => f.debug_tuple("Branch").field(entries).finish(),
            Node::Leaf(entries) => f.debug_tuple("Leaf").field(entries).finish(),
        }
    }
}

impl<S: Shape> Node<S> {
    pub fn empty_leaf() -> Self {
        Node::Leaf(Vec::new())
    }

    /// Decode a block written for the container type `type_hash`
    pub fn decode(id: &BlockId, block: &Block, type_hash: u64) -> Result<Self> {
        if block.header.type_hash != type_hash {
            return Err(CoreError::corrupt(
                *id,
                format!(
                    "type hash {:016x} does not match container type {:016x}",
                    block.header.type_hash, type_hash
                ),
            ));
        }
        let node = match block.header.kind {
            BlockKind::Branch => branch::decode::<S::KeyCodec>(&block.payload).map(Node::Branch),
            BlockKind::Leaf => S::Layout::decode(&block.payload).map(Node::Leaf),
            BlockKind::Raw => return Err(CoreError::corrupt(*id, "raw block inside a tree")),
        };
        let node = node.map_err(|e| CoreError::corrupt(*id, e.to_string()))?;
        if let Node::Branch(entries) = &node {
            if entries.is_empty() {
                return Err(CoreError::corrupt(*id, "branch without children"));
            }
        }
        Ok(node)
    }

    pub fn encode(&self, type_hash: u64, epoch: u64) -> Block {
        let mut buf = BytesMut::with_capacity(self.payload_len());
        let kind = match self {
            Node::Branch(entries) => {
                branch::encode::<S::KeyCodec>(entries, &mut buf);
                BlockKind::Branch
            }
            Node::Leaf(entries) => {
                S::Layout::encode(entries, &mut buf);
                BlockKind::Leaf
            }
        };
        Block::new(BlockHeader::new(kind, type_hash, epoch), buf.freeze())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Branch(entries) => entries.len(),
            Node::Leaf(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the children, empty for leaves
    pub fn child_ids(&self) -> Vec<BlockId> {
        match self {
            Node::Branch(entries) => entries.iter().map(|e| e.child).collect(),
            Node::Leaf(_) => Vec::new(),
        }
    }

    /// Aggregate over everything below this node
    ///
    /// Fails with [`CoreError::WeightOverflow`] when the total weight does
    /// not fit in a `u64`.
    pub fn accumulator(&self) -> Result<Accumulator> {
        let acc = match self {
            Node::Branch(entries) => entries
                .iter()
                .try_fold(Accumulator::ZERO, |total, e| total.checked_add(e.acc)),
            Node::Leaf(entries) => entries
                .iter()
                .try_fold(0u64, |total, (_, v)| total.checked_add(S::weight(v)))
                .map(|weight| Accumulator::new(entries.len() as u64, weight)),
        };
        acc.ok_or(CoreError::WeightOverflow)
    }

    /// Largest key below this node
    pub fn max_key(&self) -> Option<&S::Key> {
        match self {
            Node::Branch(entries) => entries.last().map(|e| &e.key),
            Node::Leaf(entries) => entries.last().map(|(k, _)| k),
        }
    }

    /// Bytes each entry contributes to the payload
    pub fn entry_sizes(&self) -> Vec<usize> {
        match self {
            Node::Branch(entries) => entries.iter().map(branch::entry_len::<S::KeyCodec>).collect(),
            Node::Leaf(entries) => entries
                .iter()
                .map(|(k, v)| S::Layout::entry_len(k, v))
                .collect(),
        }
    }

    pub fn payload_len(&self) -> usize {
        let bytes = self.entry_sizes().iter().sum();
        self.sized_payload_len(self.len(), bytes)
    }

    fn sized_payload_len(&self, count: usize, entry_bytes: usize) -> usize {
        match self {
            Node::Branch(_) => branch::payload_len(entry_bytes),
            Node::Leaf(_) => S::Layout::payload_len(count, entry_bytes),
        }
    }

    /// Whether `count` entries totalling `entry_bytes` fit within `limit` bytes
    pub fn parts_fit(&self, count: usize, entry_bytes: usize, limit: usize, limits: &NodeLimits) -> bool {
        if let Node::Branch(_) = self {
            if count > limits.max_fanout {
                return false;
            }
        }
        self.sized_payload_len(count, entry_bytes) <= limit
    }

    pub fn fits(&self, limits: &NodeLimits) -> bool {
        self.parts_fit(self.len(), self.entry_sizes().iter().sum(), limits.budget, limits)
    }

    pub fn is_underfull(&self, limits: &NodeLimits) -> bool {
        self.payload_len() < limits.min_fill
    }

    /// Move all entries of `other` onto the end of this node
    pub fn append(&mut self, other: Node<S>) -> std::result::Result<(), Node<S>> {
        match (self, other) {
            (Node::Branch(a), Node::Branch(mut b)) => {
                a.append(&mut b);
                Ok(())
            }
            (Node::Leaf(a), Node::Leaf(mut b)) => {
                a.append(&mut b);
                Ok(())
            }
            (_, other) => Err(other),
        }
    }

    /// Cut this node into consecutive pieces
    pub fn split_ranges(self, ranges: &[Range<usize>]) -> Vec<Node<S>> {
        fn cut<T>(mut entries: Vec<T>, ranges: &[Range<usize>]) -> Vec<Vec<T>> {
            let mut pieces = Vec::with_capacity(ranges.len());
            for range in ranges.iter().rev() {
                pieces.push(entries.split_off(range.start));
            }
            pieces.reverse();
            pieces
        }
        match self {
            Node::Branch(entries) => cut(entries, ranges).into_iter().map(Node::Branch).collect(),
            Node::Leaf(entries) => cut(entries, ranges).into_iter().map(Node::Leaf).collect(),
        }
    }

    /// Plan how to cut an overfull node so every piece fits the budget
    pub fn plan_split(&self, limits: &NodeLimits) -> Vec<Range<usize>> {
        let sizes = self.entry_sizes();
        plan_pieces(&sizes, |count, bytes| self.parts_fit(count, bytes, limits.budget, limits))
    }

    /// Plan pieces for a bulk build, each aiming at the bulk fill target
    pub fn plan_bulk(&self, limits: &NodeLimits) -> Vec<Range<usize>> {
        let sizes = self.entry_sizes();
        let mut ranges = pack_greedy(&sizes, |count, bytes| {
            self.parts_fit(count, bytes, limits.bulk_fill, limits)
        });
        // Fold an underfull tail into its neighbour when the pair fits a block
        if ranges.len() >= 2 {
            let last = ranges.len() - 1;
            let tail: usize = sizes[ranges[last].clone()].iter().sum();
            if self.sized_payload_len(ranges[last].len(), tail) < limits.min_fill {
                let merged = ranges[last - 1].start..ranges[last].end;
                let pieces = plan_pieces(&sizes[merged.clone()], |count, bytes| {
                    self.parts_fit(count, bytes, limits.budget, limits)
                });
                ranges.truncate(last - 1);
                ranges.extend(
                    pieces
                        .into_iter()
                        .map(|r| r.start + merged.start..r.end + merged.start),
                );
            }
        }
        ranges
    }
}

/// Split `sizes` into consecutive ranges that each satisfy `fits`
///
/// Prefers a single cut that balances bytes (then entry counts) between the
/// halves; falls back to greedy packing when no single cut works.
pub fn plan_pieces(sizes: &[usize], fits: impl Fn(usize, usize) -> bool) -> Vec<Range<usize>> {
    let n = sizes.len();
    let total: usize = sizes.iter().sum();
    if n <= 1 || fits(n, total) {
        return vec![0..n];
    }

    let mut best: Option<(usize, (usize, usize))> = None;
    let mut prefix = 0;
    for cut in 1..n {
        prefix += sizes[cut - 1];
        if !fits(cut, prefix) || !fits(n - cut, total - prefix) {
            continue;
        }
        let score = ((2 * prefix).abs_diff(total), (2 * cut).abs_diff(n));
        if best.map_or(true, |(_, s)| score < s) {
            best = Some((cut, score));
        }
    }
    match best {
        Some((cut, _)) => vec![0..cut, cut..n],
        None => pack_greedy(sizes, fits),
    }
}

/// Fill ranges left to right as long as `fits` holds; every range gets at
/// least one entry
pub fn pack_greedy(sizes: &[usize], fits: impl Fn(usize, usize) -> bool) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut bytes = 0;
    for (idx, size) in sizes.iter().enumerate() {
        let count = idx - start;
        if count > 0 && !fits(count + 1, bytes + size) {
            ranges.push(start..idx);
            start = idx;
            bytes = 0;
        }
        bytes += size;
    }
    if start < sizes.len() || ranges.is_empty() {
        ranges.push(start..sizes.len());
    }
    ranges
}
