//! LEB128 varints and zigzag signed integers

use super::{ensure, DecodeError};
use bytes::{Buf, BufMut};

/// Longest LEB128 encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Encoded length of `value` in bytes
#[inline]
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Append `value` as LEB128
pub fn put_u64(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read a LEB128 value, advancing `buf`
pub fn get_u64(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        ensure(buf, 1, "varint")?;
        let byte = buf.get_u8();
        let low = (byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && low > 1 {
            return Err(DecodeError::new("varint overflows u64"));
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::new("varint longer than 10 bytes"))
}

#[inline]
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(127, 1)]
    #[case(128, 2)]
    #[case(16_383, 2)]
    #[case(16_384, 3)]
    #[case(u64::MAX, 10)]
    fn test_encoded_len(#[case] value: u64, #[case] len: usize) {
        assert_eq!(encoded_len(value), len);
        let mut buf = Vec::new();
        put_u64(&mut buf, value);
        assert_eq!(buf.len(), len);
    }

    #[test]
    fn test_truncated_varint() {
        let mut input: &[u8] = &[0x80, 0x80];
        assert!(get_u64(&mut input).is_err());
    }

    #[test]
    fn test_overlong_varint() {
        let mut input: &[u8] = &[0xff; 11];
        assert!(get_u64(&mut input).is_err());
    }

    #[test]
    fn test_zigzag_small_magnitudes_stay_small() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(unzigzag(zigzag(i64::MIN)), i64::MIN);
    }

    proptest! {
        #[test]
        fn prop_varint_reads_back(value in any::<u64>(), tail in proptest::collection::vec(any::<u8>(), 0..4)) {
            let mut buf = Vec::new();
            put_u64(&mut buf, value);
            buf.extend_from_slice(&tail);
            let mut input = buf.as_slice();
            prop_assert_eq!(get_u64(&mut input).unwrap(), value);
            prop_assert_eq!(input, tail.as_slice());
        }
    }
}
