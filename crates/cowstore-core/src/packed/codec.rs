//! Item codecs
//!
//! A [`Codec`] turns one item into bytes and back. Codecs are zero-sized
//! marker types so that a container's key and value encodings are part of
//! its type, and therefore of its signature.
//!
//! [`Encodable`] picks the default codec for a Rust type. Integers default to
//! varints; wrap them in [`Fixed`] to get fixed-width little-endian encoding.

use super::{ensure, varint, DecodeError};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::Debug;
use std::marker::PhantomData;

/// Encoding of a single item
pub trait Codec: Send + Sync + 'static {
    /// The decoded item
    type Item: Clone + Debug + Send + Sync + 'static;

    /// Encoded size when it does not depend on the item
    const FIXED: Option<usize> = None;

    /// Name used in container signatures
    fn name() -> String;

    /// Bytes needed to encode `item`
    fn encoded_len(item: &Self::Item) -> usize;

    /// Append `item` to `buf`
    fn encode(item: &Self::Item, buf: &mut BytesMut);

    /// Read one item, advancing `buf`
    fn decode(buf: &mut &[u8]) -> Result<Self::Item, DecodeError>;
}

/// Types with a default codec
pub trait Encodable: Clone + Debug + Send + Sync + 'static {
    type Codec: Codec<Item = Self>;
}

/// Zero-byte encoding of `()`
pub struct Unit;

impl Codec for Unit {
    type Item = ();
    const FIXED: Option<usize> = Some(0);

    fn name() -> String {
        "unit".to_string()
    }

    fn encoded_len(_: &()) -> usize {
        0
    }

    fn encode(_: &(), _: &mut BytesMut) {}

    fn decode(_: &mut &[u8]) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// One byte, 0 or 1
pub struct BoolByte;

impl Codec for BoolByte {
    type Item = bool;
    const FIXED: Option<usize> = Some(1);

    fn name() -> String {
        "bool".to_string()
    }

    fn encoded_len(_: &bool) -> usize {
        1
    }

    fn encode(item: &bool, buf: &mut BytesMut) {
        buf.put_u8(*item as u8);
    }

    fn decode(buf: &mut &[u8]) -> Result<bool, DecodeError> {
        ensure(buf, 1, "bool")?;
        match buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError(format!("invalid bool byte {}", other))),
        }
    }
}

/// LEB128 unsigned 64-bit integer
pub struct VarU64;

impl Codec for VarU64 {
    type Item = u64;

    fn name() -> String {
        "var_u64".to_string()
    }

    fn encoded_len(item: &u64) -> usize {
        varint::encoded_len(*item)
    }

    fn encode(item: &u64, buf: &mut BytesMut) {
        varint::put_u64(buf, *item);
    }

    fn decode(buf: &mut &[u8]) -> Result<u64, DecodeError> {
        varint::get_u64(buf)
    }
}

/// LEB128 unsigned 32-bit integer
pub struct VarU32;

impl Codec for VarU32 {
    type Item = u32;

    fn name() -> String {
        "var_u32".to_string()
    }

    fn encoded_len(item: &u32) -> usize {
        varint::encoded_len(*item as u64)
    }

    fn encode(item: &u32, buf: &mut BytesMut) {
        varint::put_u64(buf, *item as u64);
    }

    fn decode(buf: &mut &[u8]) -> Result<u32, DecodeError> {
        let value = varint::get_u64(buf)?;
        u32::try_from(value).map_err(|_| DecodeError::new("varint overflows u32"))
    }
}

/// Zigzag LEB128 signed 64-bit integer
pub struct VarI64;

impl Codec for VarI64 {
    type Item = i64;

    fn name() -> String {
        "var_i64".to_string()
    }

    fn encoded_len(item: &i64) -> usize {
        varint::encoded_len(varint::zigzag(*item))
    }

    fn encode(item: &i64, buf: &mut BytesMut) {
        varint::put_u64(buf, varint::zigzag(*item));
    }

    fn decode(buf: &mut &[u8]) -> Result<i64, DecodeError> {
        varint::get_u64(buf).map(varint::unzigzag)
    }
}

/// Length-prefixed UTF-8 string
pub struct Utf8;

impl Codec for Utf8 {
    type Item = String;

    fn name() -> String {
        "utf8".to_string()
    }

    fn encoded_len(item: &String) -> usize {
        varint::encoded_len(item.len() as u64) + item.len()
    }

    fn encode(item: &String, buf: &mut BytesMut) {
        varint::put_u64(buf, item.len() as u64);
        buf.put_slice(item.as_bytes());
    }

    fn decode(buf: &mut &[u8]) -> Result<String, DecodeError> {
        let raw = read_prefixed(buf, "string")?;
        String::from_utf8(raw).map_err(|e| DecodeError(e.to_string()))
    }
}

/// Length-prefixed byte string
pub struct RawBytes;

impl Codec for RawBytes {
    type Item = Vec<u8>;

    fn name() -> String {
        "bytes".to_string()
    }

    fn encoded_len(item: &Vec<u8>) -> usize {
        varint::encoded_len(item.len() as u64) + item.len()
    }

    fn encode(item: &Vec<u8>, buf: &mut BytesMut) {
        varint::put_u64(buf, item.len() as u64);
        buf.put_slice(item);
    }

    fn decode(buf: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
        read_prefixed(buf, "byte string")
    }
}

fn read_prefixed(buf: &mut &[u8], what: &str) -> Result<Vec<u8>, DecodeError> {
    let len = varint::get_u64(buf)? as usize;
    ensure(buf, len, what)?;
    let (head, tail) = buf.split_at(len);
    let out = head.to_vec();
    *buf = tail;
    Ok(out)
}

/// Two codecs back to back
pub struct Pair<A, B>(PhantomData<fn() -> (A, B)>);

impl<A: Codec, B: Codec> Codec for Pair<A, B> {
    type Item = (A::Item, B::Item);

    const FIXED: Option<usize> = match (A::FIXED, B::FIXED) {
        (Some(a), Some(b)) => Some(a + b),
        _ => None,
    };

    fn name() -> String {
        format!("pair<{},{}>", A::name(), B::name())
    }

    fn encoded_len(item: &Self::Item) -> usize {
        A::encoded_len(&item.0) + B::encoded_len(&item.1)
    }

    fn encode(item: &Self::Item, buf: &mut BytesMut) {
        A::encode(&item.0, buf);
        B::encode(&item.1, buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self::Item, DecodeError> {
        let a = A::decode(buf)?;
        let b = B::decode(buf)?;
        Ok((a, b))
    }
}

/// Fixed-width little-endian encoding for integers
///
/// ```
/// use cowstore_core::packed::{Codec, Encodable, Fixed};
///
/// type C = <Fixed<u64> as Encodable>::Codec;
/// assert_eq!(C::FIXED, Some(8));
/// assert_eq!(C::encoded_len(&Fixed(1)), 8);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed<T>(pub T);

macro_rules! fixed_codec {
    ($ty:ty, $name:literal, $put:ident, $get:ident) => {
        impl Codec for Fixed<$ty> {
            type Item = Fixed<$ty>;
            const FIXED: Option<usize> = Some(std::mem::size_of::<$ty>());

            fn name() -> String {
                $name.to_string()
            }

            fn encoded_len(_: &Self::Item) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn encode(item: &Self::Item, buf: &mut BytesMut) {
                buf.$put(item.0);
            }

            fn decode(buf: &mut &[u8]) -> Result<Self::Item, DecodeError> {
                ensure(buf, std::mem::size_of::<$ty>(), $name)?;
                Ok(Fixed(buf.$get()))
            }
        }

        impl Encodable for Fixed<$ty> {
            type Codec = Fixed<$ty>;
        }
    };
}

fixed_codec!(u32, "fixed_u32", put_u32_le, get_u32_le);
fixed_codec!(u64, "fixed_u64", put_u64_le, get_u64_le);
fixed_codec!(i64, "fixed_i64", put_i64_le, get_i64_le);

impl Encodable for () {
    type Codec = Unit;
}

impl Encodable for bool {
    type Codec = BoolByte;
}

impl Encodable for u32 {
    type Codec = VarU32;
}

impl Encodable for u64 {
    type Codec = VarU64;
}

impl Encodable for i64 {
    type Codec = VarI64;
}

impl Encodable for String {
    type Codec = Utf8;
}

impl Encodable for Vec<u8> {
    type Codec = RawBytes;
}

impl<A: Encodable, B: Encodable> Encodable for (A, B) {
    type Codec = Pair<A::Codec, B::Codec>;
}

/// Encode one item into a fresh buffer
pub fn to_bytes<C: Codec>(item: &C::Item) -> BytesMut {
    let mut buf = BytesMut::with_capacity(C::encoded_len(item));
    C::encode(item, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all<C: Codec>(bytes: &[u8]) -> C::Item {
        let mut input = bytes;
        let item = C::decode(&mut input).unwrap();
        assert!(input.is_empty(), "codec {} left trailing bytes", C::name());
        item
    }

    #[test]
    fn test_encoded_len_matches_output() {
        let s = "héllo wörld".to_string();
        assert_eq!(to_bytes::<Utf8>(&s).len(), Utf8::encoded_len(&s));
        assert_eq!(decode_all::<Utf8>(&to_bytes::<Utf8>(&s)), s);

        let v = -300_i64;
        assert_eq!(to_bytes::<VarI64>(&v).len(), 2);
        assert_eq!(decode_all::<VarI64>(&to_bytes::<VarI64>(&v)), v);
    }

    #[test]
    fn test_fixed_width() {
        let bytes = to_bytes::<Fixed<u64>>(&Fixed(0x0102));
        assert_eq!(&bytes[..], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode_all::<Fixed<u64>>(&bytes), Fixed(0x0102));
    }

    #[test]
    fn test_pair_name_and_width() {
        type P = Pair<Fixed<u32>, BoolByte>;
        assert_eq!(P::name(), "pair<fixed_u32,bool>");
        assert_eq!(P::FIXED, Some(5));
        assert_eq!(Pair::<Utf8, Unit>::FIXED, None);
    }

    #[test]
    fn test_invalid_input() {
        let mut bad_bool: &[u8] = &[7];
        assert!(BoolByte::decode(&mut bad_bool).is_err());

        let mut bad_utf8: &[u8] = &[2, 0xff, 0xfe];
        assert!(Utf8::decode(&mut bad_utf8).is_err());

        let mut short: &[u8] = &[5, b'a'];
        assert!(RawBytes::decode(&mut short).is_err());

        let mut too_big: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0x1f];
        assert!(VarU32::decode(&mut too_big).is_err());
    }
}
