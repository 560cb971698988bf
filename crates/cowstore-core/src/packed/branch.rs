//! Packed branch index
//!
//! Branch payload layout:
//!
//! ```text
//! count u16 | child ids (16 bytes each) | (entries varint, weight varint)* | keys
//! ```
//!
//! Child ids come first and have a fixed width, so [`child_ids`] can list a
//! branch's children without knowing the key codec. Garbage collection and
//! image loading rely on that.

use super::{ensure, varint, Codec, DecodeError};
use bytes::{Buf, BufMut, BytesMut};
use cowstore_blockstore::BlockId;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Aggregate carried for every child: entry count and total weight
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Accumulator {
    pub count: u64,
    pub weight: u64,
}

impl Accumulator {
    pub const ZERO: Accumulator = Accumulator { count: 0, weight: 0 };

    pub fn new(count: u64, weight: u64) -> Self {
        Self { count, weight }
    }

    /// Entries whose weight is zero
    pub fn zeros(&self) -> u64 {
        self.count.saturating_sub(self.weight)
    }

    /// Sum of two aggregates, `None` when either total leaves `u64`
    pub fn checked_add(self, rhs: Accumulator) -> Option<Accumulator> {
        Some(Accumulator {
            count: self.count.checked_add(rhs.count)?,
            weight: self.weight.checked_add(rhs.weight)?,
        })
    }
}

impl Add for Accumulator {
    type Output = Accumulator;

    fn add(self, rhs: Accumulator) -> Accumulator {
        Accumulator {
            count: self.count + rhs.count,
            weight: self.weight + rhs.weight,
        }
    }
}

impl AddAssign for Accumulator {
    fn add_assign(&mut self, rhs: Accumulator) {
        *self = *self + rhs;
    }
}

impl Sub for Accumulator {
    type Output = Accumulator;

    fn sub(self, rhs: Accumulator) -> Accumulator {
        Accumulator {
            count: self.count - rhs.count,
            weight: self.weight - rhs.weight,
        }
    }
}

impl SubAssign for Accumulator {
    fn sub_assign(&mut self, rhs: Accumulator) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for Accumulator {
    fn sum<I: Iterator<Item = Accumulator>>(iter: I) -> Self {
        iter.fold(Accumulator::ZERO, |a, b| a + b)
    }
}

/// One child of a branch: the largest key below it, its id and its aggregate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchEntry<K> {
    pub key: K,
    pub child: BlockId,
    pub acc: Accumulator,
}

impl<K> BranchEntry<K> {
    pub fn new(key: K, child: BlockId, acc: Accumulator) -> Self {
        Self { key, child, acc }
    }
}

/// Fixed part of the payload
pub const HEADER_LEN: usize = 2;

/// Bytes one entry contributes to the payload
pub fn entry_len<C: Codec>(entry: &BranchEntry<C::Item>) -> usize {
    16 + varint::encoded_len(entry.acc.count)
        + varint::encoded_len(entry.acc.weight)
        + C::encoded_len(&entry.key)
}

pub fn payload_len(entry_bytes: usize) -> usize {
    HEADER_LEN + entry_bytes
}

pub fn encode<C: Codec>(entries: &[BranchEntry<C::Item>], buf: &mut BytesMut) {
    buf.put_u16_le(entries.len() as u16);
    for entry in entries {
        buf.put_slice(entry.child.as_bytes());
    }
    for entry in entries {
        varint::put_u64(buf, entry.acc.count);
        varint::put_u64(buf, entry.acc.weight);
    }
    for entry in entries {
        C::encode(&entry.key, buf);
    }
}

pub fn decode<C: Codec>(payload: &[u8]) -> Result<Vec<BranchEntry<C::Item>>, DecodeError> {
    let mut buf = payload;
    let children = read_ids(&mut buf)?;
    let mut accs = Vec::with_capacity(children.len());
    for _ in 0..children.len() {
        let count = varint::get_u64(&mut buf)?;
        let weight = varint::get_u64(&mut buf)?;
        accs.push(Accumulator { count, weight });
    }
    let mut entries = Vec::with_capacity(children.len());
    for (child, acc) in children.into_iter().zip(accs) {
        let key = C::decode(&mut buf)?;
        entries.push(BranchEntry { key, child, acc });
    }
    if !buf.is_empty() {
        return Err(DecodeError(format!(
            "{} trailing bytes after branch entries",
            buf.len()
        )));
    }
    Ok(entries)
}

/// Child ids of an encoded branch, whatever its key codec
pub fn child_ids(payload: &[u8]) -> Result<Vec<BlockId>, DecodeError> {
    let mut buf = payload;
    read_ids(&mut buf)
}

fn read_ids(buf: &mut &[u8]) -> Result<Vec<BlockId>, DecodeError> {
    ensure(buf, HEADER_LEN, "branch count")?;
    let count = buf.get_u16_le() as usize;
    ensure(buf, count * 16, "branch child ids")?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);
        ids.push(BlockId::from_bytes(raw));
    }
    Ok(ids)
}

/// Pick the child holding the `target`-th unit of `measure` and subtract
/// the units skipped over from `target`
///
/// The last child absorbs any overshoot so a descent always reaches a leaf.
pub fn locate<K>(
    entries: &[BranchEntry<K>],
    target: &mut u64,
    measure: impl Fn(&Accumulator) -> u64,
) -> usize {
    let last = entries.len().saturating_sub(1);
    for (idx, entry) in entries.iter().enumerate() {
        let units = measure(&entry.acc);
        if *target < units || idx == last {
            return idx;
        }
        *target -= units;
    }
    0
}
