//! Error types for the cowstore-core crate

use crate::alloc::{CtrId, SnapshotId};
use cowstore_blockstore::BlockId;
use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in engine operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Block store error (`OutOfSpace`, `InvalidBlockState`, `CorruptBlock`, ...)
    #[error("block store error: {0}")]
    BlockStore(#[from] cowstore_blockstore::BlockStoreError),

    /// Mutation outside copy-on-write discipline
    #[error("illegal mutation: {0}")]
    IllegalMutation(String),

    /// Node payload exceeds its block budget
    #[error("node full: {size} bytes exceeds budget {budget} bytes")]
    NodeFull { size: usize, budget: usize },

    /// A single entry cannot fit into a block
    #[error("payload too large: {size} bytes exceeds limit {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Block decoded with the wrong kind, layout or contents
    #[error("corrupt block {id}: {reason}")]
    CorruptBlock { id: BlockId, reason: String },

    /// Snapshot not found
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    /// Branching requires a committed parent
    #[error("snapshot not committed: {0}")]
    SnapshotNotCommitted(SnapshotId),

    /// Container not found in a snapshot directory
    #[error("container not found: {0}")]
    ContainerNotFound(CtrId),

    /// Container opened with a different type than it was created with
    #[error("signature mismatch: expected {expected}, found {actual}")]
    SignatureMismatch { expected: String, actual: String },

    /// Signature not present in the type registry
    #[error("unknown container signature: {0}")]
    UnknownSignature(String),

    /// Aggregated weight of a container no longer fits in a `u64`
    #[error("total weight would exceed u64::MAX")]
    WeightOverflow,

    /// Position outside the container
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: u64, len: u64 },

    /// Caller supplied unusable input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Structural invariant violated
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Persisted image is malformed
    #[error("corrupt image: {0}")]
    CorruptImage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn corrupt(id: BlockId, reason: impl Into<String>) -> Self {
        CoreError::CorruptBlock {
            id,
            reason: reason.into(),
        }
    }

    /// Whether this error reports exhausted backing storage
    pub fn is_out_of_space(&self) -> bool {
        matches!(
            self,
            CoreError::BlockStore(cowstore_blockstore::BlockStoreError::OutOfSpace { .. })
        )
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Configuration(err.to_string())
    }
}

impl From<serde_ipld_dagcbor::DecodeError<std::convert::Infallible>> for CoreError {
    fn from(err: serde_ipld_dagcbor::DecodeError<std::convert::Infallible>) -> Self {
        CoreError::CorruptImage(err.to_string())
    }
}
