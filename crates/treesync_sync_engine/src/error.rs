//! Error types for the sync engine.

use std::fmt;
use thiserror::Error;
use treesync_core::CoreError;
use treesync_sync_protocol::{ErrorCode, ProtocolError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The authentication provider could not produce an identity.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The authority refused a request.
    #[error("authority refused request ({code}): {message}")]
    Rejected {
        /// Reason class.
        code: ErrorCode,
        /// Detail from the authority.
        message: String,
    },

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store error during sync.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to authority")]
    NotConnected,

    /// The connection was closed or stopped after a terminal failure.
    #[error("connection is closed")]
    Closed,
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if reconnecting and retrying can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected => true,
            SyncError::Rejected { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Classification reported to observers.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::AuthFailed(_)
            | SyncError::Rejected {
                code: ErrorCode::Unauthenticated,
                ..
            } => FailureKind::AuthFailed,
            SyncError::Rejected { code, .. } if code.is_retryable() => FailureKind::Transport,
            SyncError::Rejected { .. } | SyncError::Protocol(_) => FailureKind::Protocol,
            SyncError::Transport { .. } | SyncError::Timeout | SyncError::NotConnected => {
                FailureKind::Transport
            }
            SyncError::Store(_) => FailureKind::Store,
            SyncError::Closed => FailureKind::Closed,
        }
    }

    /// Returns true if the connection cannot recover from this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::AuthFailed | FailureKind::Protocol
        ) || matches!(self, SyncError::Transport { retryable: false, .. })
    }
}

/// Class of an asynchronous sync failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Credentials were refused. Terminal.
    AuthFailed,
    /// The authority could not be reached. Retried.
    Transport,
    /// The authority refused a request or sent garbage. Terminal.
    Protocol,
    /// The local store failed while applying changes.
    Store,
    /// The connection is closed.
    Closed,
}

/// A sync failure published on a connection's error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl From<&SyncError> for SyncFailure {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
