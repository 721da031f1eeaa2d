//! Backend errors.

use std::io;
use thiserror::Error;

/// Result alias for backend calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a log or snapshot backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying file failed.
    #[error("backend I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A read ran past the bytes written so far.
    #[error("range {offset}+{len} is outside the {size} bytes stored")]
    ReadPastEnd {
        /// First byte requested.
        offset: u64,
        /// Bytes requested.
        len: usize,
        /// Bytes stored.
        size: u64,
    },

    /// Truncation can only shrink a backend.
    #[error("cannot grow backend from {size} to {requested} bytes by truncation")]
    InvalidTruncate {
        /// Target length.
        requested: u64,
        /// Bytes stored.
        size: u64,
    },
}

impl StorageError {
    /// Whether the error says the stored bytes end earlier than expected,
    /// as after a crash mid-append.
    #[must_use]
    pub fn is_short_read(&self) -> bool {
        match self {
            StorageError::ReadPastEnd { .. } => true,
            StorageError::Io(err) => err.kind() == io::ErrorKind::UnexpectedEof,
            StorageError::InvalidTruncate { .. } => false,
        }
    }
}
