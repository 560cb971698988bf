//! Bitmap of allocated slots
//!
//! Each entry is one bit; a set bit weighs one, so branch aggregates count
//! set bits and `rank1`, `select1` and `select0` each take one descent.
//! Leaves are packed as bitmaps and answer rank and select word by word.

use super::Container;
use crate::btree::{RankWalker, SelectWalker, Shape, Tree, ZeroSelectWalker};
use crate::packed::{BitmapLayout, PackedBitmap, Unit};
use crate::{CoreError, Result};
use tracing::trace;

pub struct AllocShape;

impl AllocShape {
    fn bitmap(entries: &[((), bool)]) -> PackedBitmap {
        entries.iter().map(|(_, bit)| *bit).collect()
    }
}

impl Shape for AllocShape {
    type Key = ();
    type Value = bool;
    type KeyCodec = Unit;
    type Layout = BitmapLayout;

    const KIND: &'static str = "allocmap";
    const ORDERED: bool = false;

    fn weight(bit: &bool) -> u64 {
        u64::from(*bit)
    }

    fn leaf_rank(entries: &[((), bool)], pos: usize) -> u64 {
        Self::bitmap(entries).rank1(pos.min(entries.len())) as u64
    }

    fn leaf_select(entries: &[((), bool)], target: u64) -> Option<usize> {
        Self::bitmap(entries).select1(target as usize)
    }

    fn leaf_select_zero(entries: &[((), bool)], target: u64) -> Option<usize> {
        Self::bitmap(entries).select0(target as usize)
    }
}

pub struct AllocationMap {
    tree: Tree<AllocShape>,
}

impl Container for AllocationMap {
    type Shape = AllocShape;

    fn from_tree(tree: Tree<AllocShape>) -> Self {
        Self { tree }
    }

    fn tree(&self) -> &Tree<AllocShape> {
        &self.tree
    }
}

impl std::fmt::Debug for AllocationMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationMap")
            .field("ctr", &self.tree.ctr())
            .field("snapshot", &self.tree.snapshot_id())
            .finish()
    }
}

impl AllocationMap {
    pub fn push(&mut self, bit: bool) -> Result<()> {
        let len = self.tree.len()?;
        self.tree.insert_at(len, (), bit)
    }

    /// Append `count` clear bits
    pub fn grow(&mut self, count: u64) -> Result<()> {
        self.tree.extend((0..count).map(|_| ((), false)))?;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<Option<bool>> {
        Ok(self.tree.get_at(index)?.map(|(_, bit)| bit))
    }

    /// Set the bit at `index`, returning its previous value
    pub fn set(&mut self, index: u64, bit: bool) -> Result<bool> {
        self.tree.update_at(index, bit)
    }

    pub fn count_ones(&self) -> Result<u64> {
        self.tree.total_weight()
    }

    pub fn count_zeros(&self) -> Result<u64> {
        Ok(self.tree.summary()?.zeros())
    }

    /// Set bits before `pos`
    pub fn rank1(&self, pos: u64) -> Result<u64> {
        let len = self.tree.len()?;
        if pos > len {
            return Err(CoreError::IndexOutOfBounds { index: pos, len });
        }
        Ok(self.tree.probe(RankWalker::new(pos))?.prefix_weight)
    }

    /// Clear bits before `pos`
    pub fn rank0(&self, pos: u64) -> Result<u64> {
        Ok(pos - self.rank1(pos)?)
    }

    /// Position of the `k`-th set bit
    pub fn select1(&self, k: u64) -> Result<Option<u64>> {
        if k >= self.count_ones()? {
            return Ok(None);
        }
        Ok(Some(self.tree.probe(SelectWalker::new(k))?.position))
    }

    /// Position of the `k`-th clear bit
    pub fn select0(&self, k: u64) -> Result<Option<u64>> {
        if k >= self.count_zeros()? {
            return Ok(None);
        }
        Ok(Some(self.tree.probe(ZeroSelectWalker::new(k))?.position))
    }

    /// Claim the first clear bit, appending one when every bit is set
    pub fn allocate(&mut self) -> Result<u64> {
        let slot = match self.select0(0)? {
            Some(slot) => {
                self.set(slot, true)?;
                slot
            }
            None => {
                let slot = self.tree.len()?;
                self.push(true)?;
                slot
            }
        };
        trace!(slot, "allocated slot");
        Ok(slot)
    }

    /// Clear the bit at `index`; false when it was already clear
    pub fn release(&mut self, index: u64) -> Result<bool> {
        self.set(index, false)
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Result<bool>>> {
        Ok(self.tree.iter()?.map(|e| e.map(|(_, bit)| bit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::config::EngineConfig;
    use crate::containers::Lookup;
    use proptest::prelude::*;

    fn allocmap() -> AllocationMap {
        let alloc = Allocator::in_memory(EngineConfig::default().with_block_size(256)).unwrap();
        alloc.create_snapshot(None).create().unwrap()
    }

    #[test]
    fn test_allocate_reuses_released_slots() {
        let mut map = allocmap();
        for expected in 0..3_000u64 {
            assert_eq!(map.allocate().unwrap(), expected);
        }
        assert!(map.tree().height().unwrap() > 1);
        assert!(map.release(1_234).unwrap());
        assert!(!map.release(1_234).unwrap());
        assert!(map.release(17).unwrap());

        assert_eq!(map.count_zeros().unwrap(), 2);
        assert_eq!(map.allocate().unwrap(), 17);
        assert_eq!(map.allocate().unwrap(), 1_234);
        assert_eq!(map.allocate().unwrap(), 3_000);
        assert_eq!(map.len().unwrap(), 3_001);
        map.tree().check_invariants().unwrap();
    }

    #[test]
    fn test_grow_adds_clear_bits() {
        let mut map = allocmap();
        map.push(true).unwrap();
        map.grow(5_000).unwrap();
        assert_eq!(map.count_ones().unwrap(), 1);
        assert_eq!(map.select0(4_999).unwrap(), Some(5_000));
        assert_eq!(map.select0(5_000).unwrap(), None);
        assert_eq!(map.rank0(5_001).unwrap(), 5_000);
        assert!(matches!(map.rank1(5_002), Err(CoreError::IndexOutOfBounds { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_rank_select_inverse(bits in prop::collection::vec(any::<bool>(), 1..4_000)) {
            let mut map = allocmap();
            map.tree().bulk_load(bits.iter().map(|bit| ((), *bit)).collect()).unwrap();

            let ones = bits.iter().filter(|b| **b).count() as u64;
            prop_assert_eq!(map.count_ones().unwrap(), ones);
            prop_assert_eq!(map.rank1(bits.len() as u64).unwrap(), ones);
            for (pos, bit) in bits.iter().enumerate().step_by(7) {
                let pos = pos as u64;
                if *bit {
                    prop_assert_eq!(map.select1(map.rank1(pos).unwrap()).unwrap(), Some(pos));
                } else {
                    prop_assert_eq!(map.select0(map.rank0(pos).unwrap()).unwrap(), Some(pos));
                }
            }
            prop_assert!(map.push(true).is_ok());
        }
    }
}
