//! Request failures raised by the remote change log.

use thiserror::Error;
use vaultsync_protocol::ProtocolError;

/// Result alias for server handlers.
pub type ServerResult<T> = Result<T, ServerError>;

/// Why a request was refused or could not be served.
///
/// Everything except `Internal` is the caller's fault; an HTTP front end
/// would map those to 4xx and `Internal` to 500.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Decoded fine, but the contents break a rule (empty owner, bad record).
    #[error("rejected request: {0}")]
    InvalidRequest(String),

    /// More records in one append than `max_append_batch` allows.
    #[error("append of {size} records exceeds the limit of {max}")]
    BatchTooLarge {
        /// Records sent.
        size: usize,
        /// Configured limit.
        max: u32,
    },

    /// POST to a path the server does not route.
    #[error("no such endpoint: {0}")]
    UnknownEndpoint(String),

    /// Body was not valid CBOR for the expected message.
    #[error("undecodable body: {0}")]
    Codec(String),

    /// The server failed on its own side, e.g. while encoding a reply.
    #[error("server fault: {0}")]
    Internal(String),
}

impl ServerError {
    /// Caller-side failures, which retrying unchanged will not fix.
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Faults on the server side.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// HTTP status an HTTP front end answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::Codec(_) => 400,
            Self::UnknownEndpoint(_) => 404,
            Self::BatchTooLarge { .. } => 413,
            Self::Internal(_) => 500,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        if let ProtocolError::InvalidRecord(reason) = err {
            Self::InvalidRequest(reason)
        } else {
            Self::Codec(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_internal_faults_are_server_side() {
        assert!(ServerError::Internal("encode failed".into()).is_server_error());
        for err in [
            ServerError::InvalidRequest("empty owner id".into()),
            ServerError::BatchTooLarge { size: 2, max: 1 },
            ServerError::UnknownEndpoint("/sync/nope".into()),
            ServerError::Codec("eof".into()),
        ] {
            assert!(err.is_client_error(), "{err}");
            assert!(!err.is_server_error());
            assert!((400..500).contains(&err.status_code()), "{err}");
        }
        assert_eq!(ServerError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn batch_limit_message() {
        let err = ServerError::BatchTooLarge { size: 12, max: 10 };
        assert_eq!(err.to_string(), "append of 12 records exceeds the limit of 10");
    }

    #[test]
    fn record_problems_are_invalid_requests() {
        let err: ServerError = ProtocolError::invalid_record("empty id").into();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
        let err: ServerError = ProtocolError::Decode("eof".into()).into();
        assert!(matches!(err, ServerError::Codec(_)));
    }
}
