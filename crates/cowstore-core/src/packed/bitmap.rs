//! Bit vector with rank and select
//!
//! Backed by `bitvec` with `u64` storage in `Lsb0` order, so bit `i` lives in
//! word `i / 64` at bit position `i % 64`. That lets rank and select work a
//! word at a time with popcounts.

use super::{ensure, DecodeError};
use bitvec::prelude::*;
use bytes::{Buf, BufMut, BytesMut};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackedBitmap {
    bits: BitVec<u64, Lsb0>,
}

impl PackedBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `len` bits, all set to `value`
    pub fn repeat(value: bool, len: usize) -> Self {
        Self {
            bits: BitVec::repeat(value, len),
        }
    }

    pub fn from_bools<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        Self {
            bits: iter.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<bool> {
        self.bits.get(index).map(|bit| *bit)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        self.bits.set(index, value);
    }

    pub fn push(&mut self, value: bool) {
        self.bits.push(value);
    }

    pub fn insert(&mut self, index: usize, value: bool) {
        self.bits.insert(index, value);
    }

    pub fn remove(&mut self, index: usize) -> bool {
        self.bits.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().by_vals()
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn count_zeros(&self) -> usize {
        self.bits.count_zeros()
    }

    /// Number of set bits strictly before `pos`
    pub fn rank1(&self, pos: usize) -> usize {
        let pos = pos.min(self.len());
        self.bits[..pos].count_ones()
    }

    /// Number of clear bits strictly before `pos`
    pub fn rank0(&self, pos: usize) -> usize {
        let pos = pos.min(self.len());
        pos - self.rank1(pos)
    }

    /// Position of the `k`-th set bit (0-based)
    pub fn select1(&self, k: usize) -> Option<usize> {
        self.select_in_words(k, false)
    }

    /// Position of the `k`-th clear bit (0-based)
    pub fn select0(&self, k: usize) -> Option<usize> {
        self.select_in_words(k, true)
    }

    fn select_in_words(&self, mut k: usize, invert: bool) -> Option<usize> {
        let len = self.len();
        for (w, &raw) in self.bits.as_raw_slice().iter().enumerate() {
            let base = w * 64;
            if base >= len {
                break;
            }
            let mut word = if invert { !raw } else { raw };
            let live = len - base;
            if live < 64 {
                word &= (1u64 << live) - 1;
            }
            let ones = word.count_ones() as usize;
            if k < ones {
                for _ in 0..k {
                    word &= word - 1;
                }
                return Some(base + word.trailing_zeros() as usize);
            }
            k -= ones;
        }
        None
    }

    /// Split off the bits at and after `at`
    pub fn split_off(&mut self, at: usize) -> PackedBitmap {
        PackedBitmap {
            bits: self.bits.split_off(at),
        }
    }

    pub fn append(&mut self, other: &mut PackedBitmap) {
        self.bits.append(&mut other.bits);
    }

    /// Bytes needed by [`encode`](Self::encode) for `len` bits
    pub fn encoded_len(len: usize) -> usize {
        4 + len.div_ceil(64) * 8
    }

    /// Append `count u32 | words u64*`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        let words = self.len().div_ceil(64);
        let raw = self.bits.as_raw_slice();
        for w in 0..words {
            let mut word = raw.get(w).copied().unwrap_or(0);
            let live = self.len() - w * 64;
            if live < 64 {
                word &= (1u64 << live) - 1;
            }
            buf.put_u64_le(word);
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        ensure(buf, 4, "bitmap length")?;
        let len = buf.get_u32_le() as usize;
        let words = len.div_ceil(64);
        ensure(buf, words * 8, "bitmap words")?;
        let raw: Vec<u64> = (0..words).map(|_| buf.get_u64_le()).collect();
        let mut bits = BitVec::<u64, Lsb0>::from_vec(raw);
        if bits[len..].any() {
            return Err(DecodeError::new("bitmap has bits set past its length"));
        }
        bits.truncate(len);
        Ok(Self { bits })
    }
}

impl FromIterator<bool> for PackedBitmap {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        Self::from_bools(iter)
    }
}
