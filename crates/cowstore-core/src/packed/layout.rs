//! Leaf payload layouts
//!
//! A layout decides how a leaf's `(key, value)` entries are packed into a
//! block payload, and how many bytes a candidate set of entries would take.
//! The engine only ever asks for sizes through [`LeafLayout::payload_len`],
//! so layouts are free to pack entries however they like.

use super::{ensure, Codec, DecodeError, PackedBitmap};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::Debug;
use std::marker::PhantomData;

pub trait LeafLayout: Send + Sync + 'static {
    type Key: Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Debug + Send + Sync + 'static;

    /// Name used in container signatures
    fn name() -> String;

    /// Bytes one entry contributes to the payload
    fn entry_len(key: &Self::Key, value: &Self::Value) -> usize;

    /// Payload size of `count` entries whose `entry_len`s sum to `entry_bytes`
    fn payload_len(count: usize, entry_bytes: usize) -> usize;

    fn encode(entries: &[(Self::Key, Self::Value)], buf: &mut BytesMut);

    fn decode(payload: &[u8]) -> Result<Vec<(Self::Key, Self::Value)>, DecodeError>;
}

/// `count u32 | (key, value)*` with each item in its own codec
pub struct PairLayout<K, V>(PhantomData<fn() -> (K, V)>);

impl<K: Codec, V: Codec> LeafLayout for PairLayout<K, V> {
    type Key = K::Item;
    type Value = V::Item;

    fn name() -> String {
        format!("pairs<{},{}>", K::name(), V::name())
    }

    fn entry_len(key: &K::Item, value: &V::Item) -> usize {
        K::encoded_len(key) + V::encoded_len(value)
    }

    fn payload_len(_count: usize, entry_bytes: usize) -> usize {
        4 + entry_bytes
    }

    fn encode(entries: &[(K::Item, V::Item)], buf: &mut BytesMut) {
        buf.put_u32_le(entries.len() as u32);
        for (key, value) in entries {
            K::encode(key, buf);
            V::encode(value, buf);
        }
    }

    fn decode(payload: &[u8]) -> Result<Vec<(K::Item, V::Item)>, DecodeError> {
        let mut buf = payload;
        ensure(buf, 4, "entry count")?;
        let count = buf.get_u32_le() as usize;
        // Every entry takes at least one byte unless both codecs are empty
        if K::FIXED != Some(0) || V::FIXED != Some(0) {
            let min = K::FIXED.unwrap_or(1) + V::FIXED.unwrap_or(1);
            if count.saturating_mul(min.max(1)) > buf.len() {
                return Err(DecodeError::truncated("leaf entries"));
            }
        }
        let mut entries = Vec::with_capacity(count.min(payload.len()));
        for _ in 0..count {
            let key = K::decode(&mut buf)?;
            let value = V::decode(&mut buf)?;
            entries.push((key, value));
        }
        if !buf.is_empty() {
            return Err(DecodeError(format!(
                "{} trailing bytes after leaf entries",
                buf.len()
            )));
        }
        Ok(entries)
    }
}

/// Bits packed 64 to a word; entries carry no key
pub struct BitmapLayout;

impl LeafLayout for BitmapLayout {
    type Key = ();
    type Value = bool;

    fn name() -> String {
        "bitmap".to_string()
    }

    fn entry_len(_: &(), _: &bool) -> usize {
        0
    }

    fn payload_len(count: usize, _entry_bytes: usize) -> usize {
        PackedBitmap::encoded_len(count)
    }

    fn encode(entries: &[((), bool)], buf: &mut BytesMut) {
        PackedBitmap::from_bools(entries.iter().map(|(_, bit)| *bit)).encode(buf);
    }

    fn decode(payload: &[u8]) -> Result<Vec<((), bool)>, DecodeError> {
        let mut buf = payload;
        let bitmap = PackedBitmap::decode(&mut buf)?;
        if !buf.is_empty() {
            return Err(DecodeError::new("trailing bytes after bitmap"));
        }
        Ok(bitmap.iter().map(|bit| ((), bit)).collect())
    }
}
