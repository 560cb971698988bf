//! Sequence of weighted items
//!
//! Branch aggregates carry the sum of weights below them, so prefix sums and
//! the inverse search (which item covers a given unit of weight) take one
//! descent each.

use super::Container;
use crate::btree::{RankWalker, SelectWalker, Shape, Tree};
use crate::packed::{Encodable, Pair, PairLayout, Unit, VarU64};
use crate::{CoreError, Result};
use std::marker::PhantomData;

pub struct WeightedShape<T>(PhantomData<fn() -> T>);

impl<T: Encodable> Shape for WeightedShape<T> {
    type Key = ();
    type Value = (T, u64);
    type KeyCodec = Unit;
    type Layout = PairLayout<Unit, Pair<T::Codec, VarU64>>;

    const KIND: &'static str = "weighted";
    const ORDERED: bool = false;

    fn weight(value: &(T, u64)) -> u64 {
        value.1
    }
}

/// Item found by [`WeightedTree::find_by_weight`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightHit<T> {
    pub index: u64,
    pub item: T,
    pub weight: u64,
    /// Total weight of the items before this one
    pub offset: u64,
}

pub struct WeightedTree<T: Encodable> {
    tree: Tree<WeightedShape<T>>,
}

container_impl!(WeightedTree<T> => WeightedShape, where T: Encodable);

impl<T: Encodable> WeightedTree<T> {
    pub fn push(&mut self, item: T, weight: u64) -> Result<()> {
        let len = self.tree.len()?;
        self.tree.insert_at(len, (), (item, weight))
    }

    pub fn insert(&mut self, index: u64, item: T, weight: u64) -> Result<()> {
        self.tree.insert_at(index, (), (item, weight))
    }

    pub fn get(&self, index: u64) -> Result<Option<(T, u64)>> {
        Ok(self.tree.get_at(index)?.map(|(_, value)| value))
    }

    /// Change the weight at `index`, returning the old weight
    pub fn set_weight(&mut self, index: u64, weight: u64) -> Result<u64> {
        let Some((item, _)) = self.get(index)? else {
            return Err(CoreError::IndexOutOfBounds {
                index,
                len: self.tree.len()?,
            });
        };
        Ok(self.tree.update_at(index, (item, weight))?.1)
    }

    pub fn remove(&mut self, index: u64) -> Result<(T, u64)> {
        Ok(self.tree.remove_at(index)?.1)
    }

    pub fn total_weight(&self) -> Result<u64> {
        self.tree.total_weight()
    }

    /// Total weight of the items before `index`
    pub fn prefix_weight(&self, index: u64) -> Result<u64> {
        let len = self.tree.len()?;
        if index > len {
            return Err(CoreError::IndexOutOfBounds { index, len });
        }
        Ok(self.tree.probe(RankWalker::new(index))?.prefix_weight)
    }

    /// Item covering unit `target` of the cumulative weight
    ///
    /// Items of weight zero cover nothing and are never returned. `None`
    /// once `target` reaches the total weight.
    pub fn find_by_weight(&self, target: u64) -> Result<Option<WeightHit<T>>> {
        if target >= self.tree.total_weight()? {
            return Ok(None);
        }
        let probe = self.tree.probe(SelectWalker::new(target))?;
        Ok(probe.entry.map(|(_, (item, weight))| WeightHit {
            index: probe.position,
            item,
            weight,
            offset: probe.prefix_weight,
        }))
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Result<(T, u64)>>> {
        Ok(self.tree.iter()?.map(|e| e.map(|(_, value)| value)))
    }
}
