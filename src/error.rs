//! Error types for shardex operations.
//!
//! Every failure the engine can report is a variant of [`ShardexError`]. No
//! operation hands back a NaN distance or a silently truncated result in place
//! of one of these.

use crate::types::KeyKind;
use std::io;
use thiserror::Error;

/// Result type alias using [`ShardexError`].
pub type Result<T> = std::result::Result<T, ShardexError>;

/// Errors that can occur during shardex operations.
#[derive(Error, Debug)]
pub enum ShardexError {
    /// Unsupported metric / scalar kind / input dtype combination.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Search or distance operation on a shard with no entries.
    #[error("empty index: operation requires at least one entry")]
    EmptyIndex,

    /// Graph failed structural validation.
    #[error("corrupt graph: {0}")]
    CorruptGraph(String),

    /// Key-based operation on a shard built without key lookups.
    #[error("key lookups are disabled for this shard")]
    LookupsDisabled,

    /// Key kinds of two shards (or a key and a shard) disagree.
    #[error("key_kind mismatch: expected {expected}, got {actual}")]
    KeyKindMismatch {
        /// Key kind already fixed by the shard or collection.
        expected: KeyKind,
        /// Key kind that was offered.
        actual: KeyKind,
    },

    /// Key already present and the duplicate policy rejects it.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Key is not present in the shard.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Vector length, batch row count or key count disagrees with the shard.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected number of scalars (or packed bytes for binary input).
        expected: usize,
        /// Number provided.
        actual: usize,
    },

    /// Mutation attempted on a memory-mapped view.
    #[error("shard is a read-only view")]
    ReadOnly,

    /// Clustering input with no rows.
    #[error("empty vector set: clustering needs at least one row")]
    EmptyVectorSet,

    /// Out-of-range argument such as `k == 0` or a bad thread count.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Shard or matrix file is malformed: bad magic, unknown version, section out of bounds.
    #[error("malformed file: {0}")]
    InvalidFormat(String),

    /// CRC32 of the shard body disagrees with the header.
    #[error("checksum mismatch: shard body does not match its header")]
    ChecksumMismatch,

    /// Metadata block could not be encoded or decoded.
    #[error("metadata encoding: {0}")]
    SerializationError(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ShardexError {
    /// Creates a new `InvalidConfiguration` error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a new `CorruptGraph` error.
    pub fn corrupt_graph(msg: impl Into<String>) -> Self {
        Self::CorruptGraph(msg.into())
    }

    /// Creates a new `KeyKindMismatch` error.
    pub fn key_kind_mismatch(expected: KeyKind, actual: KeyKind) -> Self {
        Self::KeyKindMismatch { expected, actual }
    }

    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    pub fn serialization_error(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

impl From<bincode::Error> for ShardexError {
    fn from(err: bincode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
