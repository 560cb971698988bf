//! Ordered map with unique keys

use super::{key_span, Container};
use crate::btree::{Bound, Duplicates, Edge, EdgeWalker, Entries, Shape, Tree};
use crate::packed::{Encodable, PairLayout};
use crate::{CoreError, Result};
use std::marker::PhantomData;
use std::ops::RangeBounds;
use tracing::instrument;

/// Shape of [`Map`]: keys sorted and unique, packed as `(key, value)` pairs
pub struct MapShape<K, V>(PhantomData<fn() -> (K, V)>);

impl<K, V> Shape for MapShape<K, V>
where
    K: Encodable + Ord,
    V: Encodable,
{
    type Key = K;
    type Value = V;
    type KeyCodec = K::Codec;
    type Layout = PairLayout<K::Codec, V::Codec>;

    const KIND: &'static str = "map";
    const ORDERED: bool = true;
}

/// Ordered map from `K` to `V`
pub struct Map<K, V>
where
    K: Encodable + Ord,
    V: Encodable,
{
    tree: Tree<MapShape<K, V>>,
}

container_impl!(Map<K, V> => MapShape, where K: Encodable + Ord, V: Encodable);

impl<K, V> Map<K, V>
where
    K: Encodable + Ord,
    V: Encodable,
{
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.tree.get_by_key(key)?.map(|(_, value)| value))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.tree.get_by_key(key)?.is_some())
    }

    /// Insert or overwrite; returns the previous value
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.tree.insert_by_key(key, value, Duplicates::Replace)
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        Ok(self.tree.remove_by_key(key)?.map(|(_, value)| value))
    }

    /// Entry with the smallest key
    pub fn first(&self) -> Result<Option<(K, V)>> {
        Ok(self.tree.probe(EdgeWalker(Edge::First))?.entry)
    }

    /// Entry with the largest key
    pub fn last(&self) -> Result<Option<(K, V)>> {
        Ok(self.tree.probe(EdgeWalker(Edge::Last))?.entry)
    }

    /// Number of keys smaller than `key`
    pub fn rank_of(&self, key: &K) -> Result<u64> {
        self.tree.rank_of_key(key, Bound::Lower)
    }

    /// Entry with `rank` smaller keys
    pub fn get_by_rank(&self, rank: u64) -> Result<Option<(K, V)>> {
        self.tree.get_at(rank)
    }

    /// Entries whose keys fall in `range`, in key order
    pub fn range(&self, range: impl RangeBounds<K>) -> Result<Entries<MapShape<K, V>>> {
        let (start, end) = key_span(&self.tree, &range)?;
        self.tree.iter_range(start, end)
    }

    /// Remove the entries whose keys fall in `range`; returns how many
    #[instrument(skip(self, range), fields(ctr = %self.tree.ctr()))]
    pub fn remove_range(&mut self, range: impl RangeBounds<K>) -> Result<u64> {
        let (start, end) = key_span(&self.tree, &range)?;
        self.tree.remove_range(start, end)
    }

    /// Replace the contents with entries sorted by strictly increasing key
    pub fn bulk_load(&mut self, entries: Vec<(K, V)>) -> Result<()> {
        if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(CoreError::InvalidArgument(
                "map entries must have strictly increasing keys".to_string(),
            ));
        }
        self.tree.bulk_load(entries)
    }

    pub fn iter(&self) -> Result<Entries<MapShape<K, V>>> {
        self.tree.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::config::EngineConfig;
    use crate::containers::{Lookup, Mutator};
    use rstest::rstest;

    fn map(block_size: usize) -> Map<u64, String> {
        let alloc =
            Allocator::in_memory(EngineConfig::default().with_block_size(block_size)).unwrap();
        alloc.create_snapshot(None).create().unwrap()
    }

    #[rstest]
    #[case(256)]
    #[case(4096)]
    fn test_insert_get_remove(#[case] block_size: usize) {
        let mut map = map(block_size);
        for i in 0..1_000u64 {
            assert_eq!(map.insert(i * 2, format!("v{}", i)).unwrap(), None);
        }
        assert_eq!(map.len().unwrap(), 1_000);
        assert_eq!(map.get(&10).unwrap(), Some("v5".to_string()));
        assert_eq!(map.get(&11).unwrap(), None);
        assert_eq!(map.insert(10, "ten".into()).unwrap(), Some("v5".to_string()));
        assert_eq!(map.len().unwrap(), 1_000);

        assert_eq!(map.remove(&10).unwrap(), Some("ten".to_string()));
        assert_eq!(map.remove(&10).unwrap(), None);
        assert!(!map.contains_key(&10).unwrap());
        map.tree().check_invariants().unwrap();
    }

    #[test]
    fn test_ranks_and_edges() {
        let mut map = map(256);
        map.bulk_load((0..500u64).map(|i| (i * 10, i.to_string())).collect())
            .unwrap();
        assert_eq!(map.first().unwrap(), Some((0, "0".to_string())));
        assert_eq!(map.last().unwrap(), Some((4_990, "499".to_string())));
        assert_eq!(map.rank_of(&35).unwrap(), 4);
        assert_eq!(map.rank_of(&40).unwrap(), 4);
        assert_eq!(map.get_by_rank(4).unwrap(), Some((40, "4".to_string())));
        assert_eq!(map.get_by_rank(500).unwrap(), None);
    }

    #[test]
    fn test_range_bounds() {
        let mut map = map(256);
        map.bulk_load((0..100u64).map(|i| (i, i.to_string())).collect())
            .unwrap();

        let keys = |entries: Entries<MapShape<u64, String>>| -> Vec<u64> {
            entries.map(|e| e.unwrap().0).collect()
        };
        assert_eq!(keys(map.range(10..15).unwrap()), vec![10, 11, 12, 13, 14]);
        assert_eq!(keys(map.range(95..).unwrap()), vec![95, 96, 97, 98, 99]);
        assert_eq!(keys(map.range(..=2).unwrap()), vec![0, 1, 2]);
        assert!(keys(map.range(200..300).unwrap()).is_empty());

        assert_eq!(map.remove_range(20..80).unwrap(), 60);
        assert_eq!(map.len().unwrap(), 40);
        assert_eq!(map.get_by_rank(20).unwrap().map(|e| e.0), Some(80));
    }

    #[test]
    fn test_bulk_load_rejects_duplicate_keys() {
        let mut map = map(4096);
        let err = map
            .bulk_load(vec![(1, "a".into()), (1, "b".into())])
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_clear() {
        let mut map = map(256);
        for i in 0..300u64 {
            map.insert(i, "x".into()).unwrap();
        }
        map.clear().unwrap();
        assert!(map.is_empty().unwrap());
        assert_eq!(map.tree().height().unwrap(), 1);
        assert!(map.iter().unwrap().next().is_none());
    }
}
