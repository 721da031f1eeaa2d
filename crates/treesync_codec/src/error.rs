//! Codec error types.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding CBOR.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The bytes were not a valid encoding of the requested type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Bytes remained after a complete value was decoded.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}
