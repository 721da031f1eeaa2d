//! Error types for the TreeSync core.

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the local store and the object graph layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] treesync_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] treesync_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No principal was available for an owner-scoped operation.
    #[error("not authenticated: no owner id")]
    NotAuthenticated,

    /// The parent does not exist or belongs to another principal.
    #[error("parent not found: {0}")]
    ParentNotFound(NodeId),

    /// The node does not exist or belongs to another principal.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A commit would break referential integrity; nothing was written.
    #[error("integrity violation: {message}")]
    IntegrityViolation {
        /// What was violated.
        message: String,
    },

    /// A write was attempted from inside a change notification callback.
    #[error("writes are not allowed from inside a change notification")]
    ReentrantWrite,

    /// The store no longer accepts local writes because its connection is
    /// shutting down.
    #[error("store is sealed for shutdown")]
    StoreSealed,

    /// The store has been closed.
    #[error("store is closed")]
    StoreClosed,

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The write-ahead log or snapshot is unreadable.
    #[error("log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Byte offset of the bad frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A frame checksum did not match its payload.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Byte offset of the frame.
        offset: u64,
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum computed from the payload.
        actual: u32,
    },

    /// Operation not permitted.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an integrity violation error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors a caller can fix by changing its input, as
    /// opposed to failures of the store itself.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            CoreError::NotAuthenticated
                | CoreError::ParentNotFound(_)
                | CoreError::NodeNotFound(_)
                | CoreError::IntegrityViolation { .. }
                | CoreError::ReentrantWrite
                | CoreError::InvalidOperation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CoreError::NotAuthenticated.is_caller_error());
        assert!(CoreError::integrity("dangling child").is_caller_error());
        assert!(!CoreError::StoreClosed.is_caller_error());
        assert!(!CoreError::log_corruption(8, "bad magic").is_caller_error());
    }

    #[test]
    fn display_includes_details() {
        let err = CoreError::ChecksumMismatch {
            offset: 14,
            expected: 0xdead_beef,
            actual: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("deadbeef"));
        assert!(msg.contains("14"));
    }
}
