//! Positional sequence

use super::Container;
use crate::btree::{Edge, EdgeWalker, Shape, Tree};
use crate::packed::{Encodable, PairLayout, Unit};
use crate::Result;
use std::marker::PhantomData;

pub struct VectorShape<T>(PhantomData<fn() -> T>);

impl<T: Encodable> Shape for VectorShape<T> {
    type Key = ();
    type Value = T;
    type KeyCodec = Unit;
    type Layout = PairLayout<Unit, T::Codec>;

    const KIND: &'static str = "vector";
    const ORDERED: bool = false;
}

/// Sequence addressed by position
pub struct Vector<T: Encodable> {
    tree: Tree<VectorShape<T>>,
}

container_impl!(Vector<T> => VectorShape, where T: Encodable);

impl<T: Encodable> Vector<T> {
    pub fn get(&self, index: u64) -> Result<Option<T>> {
        Ok(self.tree.get_at(index)?.map(|(_, value)| value))
    }

    /// Replace the element at `index`, returning the old one
    pub fn set(&mut self, index: u64, value: T) -> Result<T> {
        self.tree.update_at(index, value)
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        let len = self.tree.len()?;
        self.tree.insert_at(len, (), value)
    }

    /// Remove and return the last element
    pub fn pop(&mut self) -> Result<Option<T>> {
        let len = self.tree.len()?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(self.tree.remove_at(len - 1)?.1))
    }

    /// Insert before `index`; `index == len` appends
    pub fn insert(&mut self, index: u64, value: T) -> Result<()> {
        self.tree.insert_at(index, (), value)
    }

    pub fn remove(&mut self, index: u64) -> Result<T> {
        Ok(self.tree.remove_at(index)?.1)
    }

    /// Append every element of `values` in one transaction
    pub fn extend(&mut self, values: impl IntoIterator<Item = T>) -> Result<u64> {
        self.tree.extend(values.into_iter().map(|value| ((), value)))
    }

    /// Drop the elements from `len` onwards
    pub fn truncate(&mut self, len: u64) -> Result<u64> {
        self.tree.remove_range(len, u64::MAX)
    }

    pub fn first(&self) -> Result<Option<T>> {
        Ok(self.tree.probe(EdgeWalker(Edge::First))?.entry.map(|(_, value)| value))
    }

    pub fn last(&self) -> Result<Option<T>> {
        Ok(self.tree.probe(EdgeWalker(Edge::Last))?.entry.map(|(_, value)| value))
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Result<T>>> {
        Ok(self.tree.iter()?.map(|e| e.map(|(_, value)| value)))
    }
}
