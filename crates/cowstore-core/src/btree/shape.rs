//! Container shapes
//!
//! A [`Shape`] fixes everything the generic engine needs to know about one
//! container type: key and value types, how they are packed, whether keys
//! are ordered, and what each entry weighs.

use crate::packed::{Codec, LeafLayout};
use std::fmt::Debug;

pub trait Shape: Send + Sync + 'static {
    type Key: Clone + Ord + Debug + Send + Sync + 'static;
    type Value: Clone + Debug + Send + Sync + 'static;
    type KeyCodec: Codec<Item = Self::Key>;
    type Layout: LeafLayout<Key = Self::Key, Value = Self::Value>;

    /// Container family, e.g. `map`
    const KIND: &'static str;

    /// Whether entries are kept sorted by key
    const ORDERED: bool;

    /// Stable textual identity of the container type
    fn signature() -> String {
        format!("{}<{}>", Self::KIND, Self::Layout::name())
    }

    /// Weight contributed by one value
    fn weight(_value: &Self::Value) -> u64 {
        0
    }

    /// Total weight of the first `pos` entries of a leaf
    fn leaf_rank(entries: &[(Self::Key, Self::Value)], pos: usize) -> u64 {
        entries[..pos.min(entries.len())]
            .iter()
            .fold(0u64, |total, (_, v)| total.saturating_add(Self::weight(v)))
    }

    /// Index of the entry holding the `target`-th unit of weight
    fn leaf_select(entries: &[(Self::Key, Self::Value)], target: u64) -> Option<usize> {
        let mut seen = 0u64;
        for (idx, (_, value)) in entries.iter().enumerate() {
            seen = seen.saturating_add(Self::weight(value));
            if target < seen {
                return Some(idx);
            }
        }
        None
    }

    /// Index of the `target`-th weightless entry
    fn leaf_select_zero(entries: &[(Self::Key, Self::Value)], target: u64) -> Option<usize> {
        entries
            .iter()
            .enumerate()
            .filter(|(_, (_, v))| Self::weight(v) == 0)
            .nth(target as usize)
            .map(|(idx, _)| idx)
    }
}
