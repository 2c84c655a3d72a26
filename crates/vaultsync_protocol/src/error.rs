//! Error types for protocol operations.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building, encoding or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR or JSON decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A change record has an unexpected shape.
    #[error("invalid change record: {0}")]
    InvalidRecord(String),
}

impl ProtocolError {
    /// Creates an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }
}
