//! Error types for the sync server.

use thiserror::Error;
use treesync_core::CoreError;
use treesync_sync_protocol::{Cursor, ErrorCode, ProtocolError, SessionId};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync authority.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The principal may not touch the data.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No such session.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// The authority is switched off.
    #[error("authority unavailable")]
    Unavailable,

    /// The cursor points before the retained change log.
    #[error("cursor {requested} expired, oldest retained is {oldest}")]
    CursorExpired {
        /// Cursor the client asked for.
        requested: Cursor,
        /// Oldest cursor that can still be pulled from.
        oldest: Cursor,
    },

    /// Canonical store error.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// Frame error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Wire code reported to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::AuthenticationFailed(_) => ErrorCode::Unauthenticated,
            ServerError::Forbidden(_) => ErrorCode::Forbidden,
            ServerError::UnknownSession(_) => ErrorCode::UnknownSession,
            ServerError::CursorExpired { .. } => ErrorCode::CursorExpired,
            ServerError::Unavailable | ServerError::Store(_) | ServerError::Internal(_) => {
                ErrorCode::Unavailable
            }
        }
    }

    /// Returns true if the client caused the error.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::Forbidden(_)
                | ServerError::UnknownSession(_)
                | ServerError::CursorExpired { .. }
                | ServerError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(!ServerError::Internal("oops".into()).is_client_error());
        assert_eq!(ServerError::Unavailable.code(), ErrorCode::Unavailable);
        assert_eq!(
            ServerError::Forbidden("x".into()).code(),
            ErrorCode::Forbidden
        );
    }

    #[test]
    fn error_display() {
        let err = ServerError::CursorExpired {
            requested: 5,
            oldest: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("5"));
    }
}
