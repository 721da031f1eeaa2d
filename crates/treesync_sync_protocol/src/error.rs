//! Protocol error types.

use thiserror::Error;
use treesync_codec::CodecError;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or interpreting protocol frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The peer answered with a response of the wrong kind.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// Response kind the request calls for.
        expected: &'static str,
        /// Response kind received.
        actual: &'static str,
    },
}
