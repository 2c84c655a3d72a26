//! Failures a sync cycle can end in.

use thiserror::Error;
use vaultsync_protocol::ProtocolError;
use vaultsync_store::StoreError;

/// Result alias used across the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the session reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Worth another attempt after backoff.
    Transient,
    /// Remote already holds a different payload under an id we uploaded.
    /// Reported to the caller and left alone.
    Conflict,
    /// Retrying would fail the same way.
    Fatal,
}

/// Why a transport call or sync cycle did not complete.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The request never got a usable answer.
    #[error("transport failure: {message}")]
    Transport {
        /// What the transport reported.
        message: String,
        /// False for failures a retry cannot fix, such as a TLS rejection.
        retryable: bool,
    },

    /// A message could not be encoded, or the reply made no sense.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote change log answered with a failure of its own.
    #[error("remote change log failed: {0}")]
    Remote(String),

    /// Reading or writing the local durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Uploaded ids whose remote payload differs from ours.
    #[error("{} change(s) conflict with the remote log: {}", ids.len(), ids.join(", "))]
    Conflict {
        /// In upload order.
        ids: Vec<String>,
    },

    /// `cancel` was called while the cycle ran.
    #[error("sync cycle cancelled")]
    Cancelled,

    /// The owner's cycle lock is held by another caller.
    #[error("owner is already syncing")]
    AlreadySyncing,

    /// The cycle exceeded its configured time limit.
    #[error("sync cycle timed out")]
    Timeout,

    /// The transport is closed or its link is down.
    #[error("transport is disconnected")]
    NotConnected,
}

impl SyncError {
    /// A transport failure that backoff may cure.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// A transport failure that will repeat on every attempt.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether `sync_with_retry` and the scheduler try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { retryable: true, .. } | Self::Timeout | Self::NotConnected | Self::Remote(_)
        )
    }

    /// Classification recorded in `SessionState::Error`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            e if e.is_retryable() => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_trouble_is_retried() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::Remote("503".into()).is_retryable());
    }

    #[test]
    fn local_and_semantic_failures_are_not() {
        assert!(!SyncError::transport_fatal("certificate rejected").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Conflict { ids: vec![] }.is_retryable());
        assert!(!SyncError::Protocol("truncated reply".into()).is_retryable());
    }

    #[test]
    fn kinds_drive_session_state() {
        assert_eq!(SyncError::NotConnected.kind(), ErrorKind::Transient);
        let conflict = SyncError::Conflict { ids: vec!["c1".into()] };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert_eq!(SyncError::Store(StoreError::corrupted("bad")).kind(), ErrorKind::Fatal);
        assert_eq!(SyncError::AlreadySyncing.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn conflict_message_lists_ids() {
        let err = SyncError::Conflict {
            ids: vec!["vault-1".into(), "vault-2".into()],
        };
        assert_eq!(
            err.to_string(),
            "2 change(s) conflict with the remote log: vault-1, vault-2"
        );
    }
}
