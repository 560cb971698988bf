//! Error types for the cowstore-blockstore crate

use crate::BlockId;
use thiserror::Error;

/// Result type alias using `BlockStoreError`
pub type Result<T> = std::result::Result<T, BlockStoreError>;

/// Errors that can occur during block storage operations
#[derive(Error, Debug)]
pub enum BlockStoreError {
    /// Backing storage has no room for the requested block
    #[error("out of space: requested {requested} bytes, {available} bytes available")]
    OutOfSpace { requested: u64, available: u64 },

    /// Use of a freed, unknown or never-written block
    #[error("invalid block state for {id}: {reason}")]
    InvalidBlockState { id: BlockId, reason: String },

    /// Checksum, length or header mismatch while decoding a block image
    #[error("corrupt block {id}: {reason}")]
    CorruptBlock { id: BlockId, reason: String },

    /// Block too large
    #[error("block too large: {size} bytes exceeds maximum {max} bytes")]
    BlockTooLarge { size: usize, max: usize },

    /// Malformed persisted block section
    #[error("corrupt block section: {0}")]
    CorruptSection(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BlockStoreError {
    pub(crate) fn invalid(id: BlockId, reason: impl Into<String>) -> Self {
        BlockStoreError::InvalidBlockState {
            id,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(id: BlockId, reason: impl Into<String>) -> Self {
        BlockStoreError::CorruptBlock {
            id,
            reason: reason.into(),
        }
    }
}
