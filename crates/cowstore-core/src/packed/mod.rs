//! Packed byte layouts for node payloads
//!
//! Everything in here works on plain byte slices: varints, item codecs,
//! the bitmap used by allocation maps, leaf layouts and the branch index.
//! Nothing here knows about blocks, snapshots or reference counts.

pub mod bitmap;
pub mod branch;
pub mod codec;
pub mod layout;
pub mod varint;

pub use bitmap::PackedBitmap;
pub use branch::{Accumulator, BranchEntry};
pub use codec::{
    BoolByte, Codec, Encodable, Fixed, Pair, RawBytes, Unit, Utf8, VarI64, VarU32, VarU64,
};
pub use layout::{BitmapLayout, LeafLayout, PairLayout};

use thiserror::Error;

/// Payload bytes could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        DecodeError(reason.into())
    }

    pub(crate) fn truncated(what: &str) -> Self {
        DecodeError(format!("truncated {}", what))
    }
}

/// Check that `buf` still holds `n` bytes before reading `what`
pub(crate) fn ensure(buf: &[u8], n: usize, what: &str) -> Result<(), DecodeError> {
    if buf.len() < n {
        Err(DecodeError::truncated(what))
    } else {
        Ok(())
    }
}
