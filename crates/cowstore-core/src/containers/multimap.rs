//! Ordered map allowing repeated keys

use super::Container;
use crate::btree::{Bound, Duplicates, Entries, KeyWalker, Shape, Tree};
use crate::packed::{Encodable, PairLayout};
use crate::Result;
use std::marker::PhantomData;

pub struct MultimapShape<K, V>(PhantomData<fn() -> (K, V)>);

impl<K, V> Shape for MultimapShape<K, V>
where
    K: Encodable + Ord,
    V: Encodable,
{
    type Key = K;
    type Value = V;
    type KeyCodec = K::Codec;
    type Layout = PairLayout<K::Codec, V::Codec>;

    const KIND: &'static str = "multimap";
    const ORDERED: bool = true;
}

/// Ordered map where one key may hold several values, kept in insertion
/// order
pub struct Multimap<K, V>
where
    K: Encodable + Ord,
    V: Encodable,
{
    tree: Tree<MultimapShape<K, V>>,
}

container_impl!(Multimap<K, V> => MultimapShape, where K: Encodable + Ord, V: Encodable);

impl<K, V> Multimap<K, V>
where
    K: Encodable + Ord,
    V: Encodable,
{
    /// Add a value after any already stored under `key`
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.tree.insert_by_key(key, value, Duplicates::Append)?;
        Ok(())
    }

    /// Number of values stored under `key`
    pub fn count(&self, key: &K) -> Result<u64> {
        let start = self.tree.rank_of_key(key, Bound::Lower)?;
        let end = self.tree.rank_of_key(key, Bound::Upper)?;
        Ok(end - start)
    }

    /// Values under `key` in insertion order
    pub fn get_all(&self, key: &K) -> Result<Vec<V>> {
        let count = self.count(key)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let cursor = self.tree.find(KeyWalker::<MultimapShape<K, V>>::lower(key))?;
        Entries::limited(cursor, count)
            .map(|entry| entry.map(|(_, value)| value))
            .collect()
    }

    /// Remove every value under `key`; returns how many were removed
    pub fn remove_all(&mut self, key: &K) -> Result<u64> {
        self.tree.remove_all_by_key(key)
    }

    /// Remove the first occurrence of `value` under `key`
    pub fn remove_one(&mut self, key: &K, value: &V) -> Result<bool>
    where
        V: PartialEq,
    {
        let start = self.tree.rank_of_key(key, Bound::Lower)?;
        let end = self.tree.rank_of_key(key, Bound::Upper)?;
        let mut position = None;
        for (offset, entry) in self.tree.iter_range(start, end)?.enumerate() {
            if &entry?.1 == value {
                position = Some(start + offset as u64);
                break;
            }
        }
        match position {
            Some(position) => {
                self.tree.remove_at(position)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn iter(&self) -> Result<Entries<MultimapShape<K, V>>> {
        self.tree.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::config::EngineConfig;
    use crate::containers::Lookup;

    #[test_log::test]
    fn test_values_keep_insertion_order() {
        let alloc = Allocator::in_memory(EngineConfig::default().with_block_size(256)).unwrap();
        let mut multimap: Multimap<String, String> = alloc.create_snapshot(None).create().unwrap();
        let tag = |s: &str| s.to_string();

        for i in 0..100 {
            multimap.insert(tag("noise"), format!("n{}", i)).unwrap();
        }
        for value in ["x", "y", "z", "y"] {
            multimap.insert(tag("letters"), tag(value)).unwrap();
        }
        assert_eq!(multimap.count(&tag("letters")).unwrap(), 4);
        assert_eq!(
            multimap.get_all(&tag("letters")).unwrap(),
            vec![tag("x"), tag("y"), tag("z"), tag("y")]
        );

        assert!(multimap.remove_one(&tag("letters"), &tag("y")).unwrap());
        assert!(!multimap.remove_one(&tag("letters"), &tag("w")).unwrap());
        assert_eq!(
            multimap.get_all(&tag("letters")).unwrap(),
            vec![tag("x"), tag("z"), tag("y")]
        );

        assert_eq!(multimap.remove_all(&tag("noise")).unwrap(), 100);
        assert_eq!(multimap.len().unwrap(), 3);
        assert!(multimap.get_all(&tag("missing")).unwrap().is_empty());
        multimap.tree().check_invariants().unwrap();
    }
}
