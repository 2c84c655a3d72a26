//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing the local store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a log.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A frame failed its checksum.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum computed over the frame.
        actual: u32,
    },

    /// A frame or log has an unexpected shape.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// A frame payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A record was refused before being written.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true if the error concerns a single damaged record rather
    /// than the store as a whole.
    pub fn is_record_damage(&self) -> bool {
        matches!(
            self,
            StoreError::ChecksumMismatch { .. } | StoreError::Corrupted(_) | StoreError::Codec(_)
        )
    }
}
