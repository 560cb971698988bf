//! Block types and the checksummed block image format

use crate::{BlockStoreError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Size of the fixed block header in bytes
pub const HEADER_LEN: usize = 32;

/// Version byte written into every block header
pub const FORMAT_VERSION: u8 = 1;

/// Offset of the checksum field inside the header
const CHECKSUM_OFFSET: usize = 24;

/// A 128-bit block identifier
///
/// The high 64 bits carry the tag of the store that minted the id, the low
/// 64 bits a per-store sequence number. Ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Build an id from a store tag and a sequence number
    pub const fn from_parts(tag: u64, seq: u64) -> Self {
        Self(Uuid::from_u128(((tag as u128) << 64) | seq as u128))
    }

    /// Build an id from its 16-byte big-endian representation
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16-byte big-endian representation
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Tag of the store that minted this id
    pub fn tag(&self) -> u64 {
        (self.0.as_u128() >> 64) as u64
    }

    /// Sequence number within the minting store
    pub fn seq(&self) -> u64 {
        self.0.as_u128() as u64
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0.hyphenated())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// What a block holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Opaque bytes
    Raw = 0,
    /// B-tree branch node
    Branch = 1,
    /// B-tree leaf node
    Leaf = 2,
}

impl BlockKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlockKind::Raw),
            1 => Some(BlockKind::Branch),
            2 => Some(BlockKind::Leaf),
            _ => None,
        }
    }
}

/// Typed block header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Kind of node stored in the payload
    pub kind: BlockKind,
    /// Hash of the container signature whose layout encoded the payload
    pub type_hash: u64,
    /// Epoch of the snapshot that wrote this block
    pub epoch: u64,
}

impl BlockHeader {
    /// Create a header
    pub fn new(kind: BlockKind, type_hash: u64, epoch: u64) -> Self {
        Self {
            kind,
            type_hash,
            epoch,
        }
    }
}

/// A block: header plus payload
///
/// Cloning is cheap; the payload is reference counted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// The header
    pub header: BlockHeader,
    /// The raw payload
    pub payload: Bytes,
}

impl Block {
    /// Create a new block
    pub fn new(header: BlockHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Create a raw block with no type information
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self::new(BlockHeader::new(BlockKind::Raw, 0, 0), payload)
    }

    /// Size of the encoded image (header + payload)
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Get the payload as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.payload
    }

    /// Encode the block into its on-store image
    ///
    /// Layout (little-endian): `kind u8 | version u8 | reserved u16 |
    /// payload_len u32 | type_hash u64 | epoch u64 | checksum u64 | payload`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.header.kind as u8);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u64_le(self.header.type_hash);
        buf.put_u64_le(self.header.epoch);
        let checksum = checksum(&buf[..CHECKSUM_OFFSET], &self.payload);
        buf.put_u64_le(checksum);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode and verify a block image
    pub fn decode(id: &BlockId, image: &Bytes) -> Result<Self> {
        if image.len() < HEADER_LEN {
            return Err(BlockStoreError::corrupt(
                *id,
                format!("image of {} bytes is shorter than the header", image.len()),
            ));
        }

        let mut header = &image[..HEADER_LEN];
        let raw_kind = header.get_u8();
        let version = header.get_u8();
        let _reserved = header.get_u16_le();
        let payload_len = header.get_u32_le() as usize;
        let type_hash = header.get_u64_le();
        let epoch = header.get_u64_le();
        let stored = header.get_u64_le();

        let kind = BlockKind::from_u8(raw_kind)
            .ok_or_else(|| BlockStoreError::corrupt(*id, format!("unknown block kind {}", raw_kind)))?;
        if version != FORMAT_VERSION {
            return Err(BlockStoreError::corrupt(
                *id,
                format!("unsupported format version {}", version),
            ));
        }
        if image.len() - HEADER_LEN != payload_len {
            return Err(BlockStoreError::corrupt(
                *id,
                format!(
                    "payload length {} does not match header {}",
                    image.len() - HEADER_LEN,
                    payload_len
                ),
            ));
        }

        let payload = image.slice(HEADER_LEN..);
        let actual = checksum(&image[..CHECKSUM_OFFSET], &payload);
        if actual != stored {
            return Err(BlockStoreError::corrupt(
                *id,
                format!("checksum mismatch: expected {:016x}, got {:016x}", stored, actual),
            ));
        }

        Ok(Self {
            header: BlockHeader::new(kind, type_hash, epoch),
            payload,
        })
    }
}

/// Checksum over the header prefix and payload: the first 8 bytes of BLAKE3
fn checksum(header: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Block {
        Block::new(
            BlockHeader::new(BlockKind::Leaf, 0xfeed_beef, 7),
            Bytes::from_static(b"leaf payload"),
        )
    }

    #[test]
    fn test_block_id_parts() {
        let id = BlockId::from_parts(0xabcd, 42);
        assert_eq!(id.tag(), 0xabcd);
        assert_eq!(id.seq(), 42);
        assert_eq!(BlockId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_block_encode_decode() {
        let block = sample();
        let image = block.encode();
        assert_eq!(image.len(), block.encoded_len());

        let decoded = Block::decode(&BlockId::from_parts(1, 1), &image).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_block_detects_flipped_payload_bit() {
        let image = sample().encode();
        let mut tampered = image.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;

        let result = Block::decode(&BlockId::from_parts(1, 1), &Bytes::from(tampered));
        assert!(matches!(result, Err(BlockStoreError::CorruptBlock { .. })));
    }

    #[test]
    fn test_block_detects_header_tampering() {
        let image = sample().encode();
        let mut tampered = image.to_vec();
        // epoch field
        tampered[16] ^= 0xff;

        let result = Block::decode(&BlockId::from_parts(1, 1), &Bytes::from(tampered));
        assert!(matches!(result, Err(BlockStoreError::CorruptBlock { .. })));
    }

    #[test]
    fn test_block_rejects_truncated_image() {
        let result = Block::decode(&BlockId::from_parts(1, 1), &Bytes::from_static(b"short"));
        assert!(matches!(result, Err(BlockStoreError::CorruptBlock { .. })));
    }
}
