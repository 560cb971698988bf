//! Walkers steer a root-to-leaf descent
//!
//! At each branch a walker picks the child to enter, and at the leaf it picks
//! a position. The engine adds the aggregates of everything skipped on the
//! left, so the cursor that comes out of a descent knows its rank and weight
//! prefix without a second pass.
//!
//! Positions may equal the leaf length; that is the insertion point after
//! the last entry.

use super::Shape;
use crate::packed::{branch, BranchEntry};
use std::cmp::Ordering;

pub trait Walker<S: Shape> {
    /// Index of the child to descend into; must be `< entries.len()`
    fn branch(&mut self, entries: &[BranchEntry<S::Key>]) -> usize;

    /// Position within the leaf; at most `entries.len()`
    fn leaf(&mut self, entries: &[(S::Key, S::Value)]) -> usize;
}

/// Which end of the tree to seek
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    /// The first entry
    First,
    /// The last entry
    Last,
    /// Just past the last entry
    End,
}

#[derive(Clone, Copy, Debug)]
pub struct EdgeWalker(pub Edge);

impl<S: Shape> Walker<S> for EdgeWalker {
    fn branch(&mut self, entries: &[BranchEntry<S::Key>]) -> usize {
        match self.0 {
            Edge::First => 0,
            Edge::Last | Edge::End => entries.len() - 1,
        }
    }

    fn leaf(&mut self, entries: &[(S::Key, S::Value)]) -> usize {
        match self.0 {
            Edge::First => 0,
            Edge::Last => entries.len().saturating_sub(1),
            Edge::End => entries.len(),
        }
    }
}

/// Where a key search lands among equal keys
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// First entry with key `>= target`
    Lower,
    /// First entry with key `> target`
    Upper,
}

/// Binary search by key; only meaningful for ordered shapes
pub struct KeyWalker<'a, S: Shape> {
    key: &'a S::Key,
    bound: Bound,
}

impl<'a, S: Shape> KeyWalker<'a, S> {
    pub fn new(key: &'a S::Key, bound: Bound) -> Self {
        Self { key, bound }
    }

    pub fn lower(key: &'a S::Key) -> Self {
        Self::new(key, Bound::Lower)
    }

    pub fn upper(key: &'a S::Key) -> Self {
        Self::new(key, Bound::Upper)
    }

    fn before(&self, candidate: &S::Key) -> bool {
        match (candidate.cmp(self.key), self.bound) {
            (Ordering::Less, _) => true,
            (Ordering::Equal, Bound::Upper) => true,
            _ => false,
        }
    }
}

impl<S: Shape> Walker<S> for KeyWalker<'_, S> {
    fn branch(&mut self, entries: &[BranchEntry<S::Key>]) -> usize {
        // Separators are the largest key of each child
        let idx = entries.partition_point(|e| self.before(&e.key));
        idx.min(entries.len() - 1)
    }

    fn leaf(&mut self, entries: &[(S::Key, S::Value)]) -> usize {
        entries.partition_point(|(k, _)| self.before(k))
    }
}

/// Seek the entry at a position (rank)
#[derive(Clone, Copy, Debug)]
pub struct RankWalker {
    remaining: u64,
}

impl RankWalker {
    pub fn new(position: u64) -> Self {
        Self { remaining: position }
    }
}

impl<S: Shape> Walker<S> for RankWalker {
    fn branch(&mut self, entries: &[BranchEntry<S::Key>]) -> usize {
        branch::locate(entries, &mut self.remaining, |acc| acc.count)
    }

    fn leaf(&mut self, entries: &[(S::Key, S::Value)]) -> usize {
        (self.remaining as usize).min(entries.len())
    }
}

/// Seek the entry holding a unit of weight
#[derive(Clone, Copy, Debug)]
pub struct SelectWalker {
    remaining: u64,
}

impl SelectWalker {
    pub fn new(target: u64) -> Self {
        Self { remaining: target }
    }
}

impl<S: Shape> Walker<S> for SelectWalker {
    fn branch(&mut self, entries: &[BranchEntry<S::Key>]) -> usize {
        branch::locate(entries, &mut self.remaining, |acc| acc.weight)
    }

    fn leaf(&mut self, entries: &[(S::Key, S::Value)]) -> usize {
        S::leaf_select(entries, self.remaining).unwrap_or(entries.len())
    }
}

/// Seek the `k`-th weightless entry
#[derive(Clone, Copy, Debug)]
pub struct ZeroSelectWalker {
    remaining: u64,
}

impl ZeroSelectWalker {
    pub fn new(target: u64) -> Self {
        Self { remaining: target }
    }
}

impl<S: Shape> Walker<S> for ZeroSelectWalker {
    fn branch(&mut self, entries: &[BranchEntry<S::Key>]) -> usize {
        branch::locate(entries, &mut self.remaining, |acc| acc.zeros())
    }

    fn leaf(&mut self, entries: &[(S::Key, S::Value)]) -> usize {
        S::leaf_select_zero(entries, self.remaining).unwrap_or(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::tests::TestShape;
    use crate::packed::Accumulator;
    use cowstore_blockstore::BlockId;

    fn separators() -> Vec<BranchEntry<u64>> {
        [10u64, 20, 30]
            .iter()
            .enumerate()
            .map(|(i, k)| BranchEntry::new(*k, BlockId::from_parts(9, i as u64), Accumulator::new(4, 0)))
            .collect()
    }

    #[test]
    fn test_key_walker_bounds() {
        let entries = separators();
        let key = 20;
        assert_eq!(Walker::<TestShape>::branch(&mut KeyWalker::<TestShape>::lower(&key), &entries), 1);
        assert_eq!(Walker::<TestShape>::branch(&mut KeyWalker::<TestShape>::upper(&key), &entries), 2);

        let beyond = 99;
        assert_eq!(Walker::<TestShape>::branch(&mut KeyWalker::<TestShape>::lower(&beyond), &entries), 2);

        let leaf: Vec<(u64, String)> = [1, 3, 3, 5].iter().map(|k| (*k, String::new())).collect();
        let three = 3;
        assert_eq!(Walker::<TestShape>::leaf(&mut KeyWalker::<TestShape>::lower(&three), &leaf), 1);
        assert_eq!(Walker::<TestShape>::leaf(&mut KeyWalker::<TestShape>::upper(&three), &leaf), 3);
    }

    #[test]
    fn test_rank_walker_subtracts_skipped_children() {
        let entries = separators();
        let mut walker = RankWalker::new(9);
        assert_eq!(Walker::<TestShape>::branch(&mut walker, &entries), 2);
        assert_eq!(walker.remaining, 1);
    }

    #[test]
    fn test_edge_walker() {
        let entries = separators();
        let leaf: Vec<(u64, String)> = vec![(1, String::new()), (2, String::new())];
        assert_eq!(Walker::<TestShape>::branch(&mut EdgeWalker(Edge::Last), &entries), 2);
        assert_eq!(Walker::<TestShape>::leaf(&mut EdgeWalker(Edge::Last), &leaf), 1);
        assert_eq!(Walker::<TestShape>::leaf(&mut EdgeWalker(Edge::End), &leaf), 2);
        assert_eq!(Walker::<TestShape>::leaf(&mut EdgeWalker(Edge::First), &leaf), 0);
    }
}
