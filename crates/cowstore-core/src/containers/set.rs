//! Ordered set

use super::{key_span, Container};
use crate::btree::{Bound, Duplicates, Edge, EdgeWalker, Shape, Tree};
use crate::packed::{Encodable, PairLayout, Unit};
use crate::Result;
use std::marker::PhantomData;
use std::ops::RangeBounds;

pub struct SetShape<K>(PhantomData<fn() -> K>);

impl<K: Encodable + Ord> Shape for SetShape<K> {
    type Key = K;
    type Value = ();
    type KeyCodec = K::Codec;
    type Layout = PairLayout<K::Codec, Unit>;

    const KIND: &'static str = "set";
    const ORDERED: bool = true;
}

/// Ordered set of `K`
pub struct Set<K: Encodable + Ord> {
    tree: Tree<SetShape<K>>,
}

container_impl!(Set<K> => SetShape, where K: Encodable + Ord);

impl<K: Encodable + Ord> Set<K> {
    /// Add `key`; false when it was already present
    pub fn insert(&mut self, key: K) -> Result<bool> {
        Ok(self.tree.insert_by_key(key, (), Duplicates::Keep)?.is_none())
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.tree.get_by_key(key)?.is_some())
    }

    /// Remove `key`; false when it was absent
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        Ok(self.tree.remove_by_key(key)?.is_some())
    }

    /// Number of members smaller than `key`
    pub fn rank_of(&self, key: &K) -> Result<u64> {
        self.tree.rank_of_key(key, Bound::Lower)
    }

    /// Member with `rank` smaller members
    pub fn select(&self, rank: u64) -> Result<Option<K>> {
        Ok(self.tree.get_at(rank)?.map(|(key, _)| key))
    }

    pub fn first(&self) -> Result<Option<K>> {
        Ok(self.tree.probe(EdgeWalker(Edge::First))?.entry.map(|(key, _)| key))
    }

    pub fn last(&self) -> Result<Option<K>> {
        Ok(self.tree.probe(EdgeWalker(Edge::Last))?.entry.map(|(key, _)| key))
    }

    /// Members in `range`, in order
    pub fn range(&self, range: impl RangeBounds<K>) -> Result<impl Iterator<Item = Result<K>>> {
        let (start, end) = key_span(&self.tree, &range)?;
        Ok(self.tree.iter_range(start, end)?.map(|e| e.map(|(key, _)| key)))
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Result<K>>> {
        Ok(self.tree.iter()?.map(|e| e.map(|(key, _)| key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::config::EngineConfig;
    use crate::containers::Lookup;
    use proptest::prelude::*;

    fn set() -> Set<String> {
        let alloc = Allocator::in_memory(EngineConfig::default().with_block_size(512)).unwrap();
        alloc.create_snapshot(None).create().unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut set = set();
        assert!(set.insert("b".into()).unwrap());
        assert!(set.insert("a".into()).unwrap());
        assert!(!set.insert("b".into()).unwrap());
        assert_eq!(set.len().unwrap(), 2);

        let members: Vec<String> = set.iter().unwrap().map(|k| k.unwrap()).collect();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
        assert!(set.remove(&"a".to_string()).unwrap());
        assert!(!set.remove(&"a".to_string()).unwrap());
        assert_eq!(set.first().unwrap(), Some("b".to_string()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_select_inverts_rank(keys in prop::collection::btree_set("[a-z]{1,12}", 1..300)) {
            let mut set = set();
            for key in &keys {
                set.insert(key.clone()).unwrap();
            }
            for (rank, key) in keys.iter().enumerate() {
                prop_assert_eq!(set.rank_of(key).unwrap(), rank as u64);
                let selected = set.select(rank as u64).unwrap();
                prop_assert_eq!(selected.as_ref(), Some(key));
            }
            prop_assert_eq!(set.select(keys.len() as u64).unwrap(), None);
        }
    }
}
