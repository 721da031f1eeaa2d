//! # TreeSync Storage
//!
//! Byte-level persistence used by the TreeSync local store.
//!
//! A backend is an opaque, append-mostly byte file. The store keeps two of
//! them: the write-ahead log (appended on every commit, truncated after a
//! checkpoint) and the snapshot file (atomically replaced on checkpoint).
//! Backends never look inside the bytes they hold.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - shared in-process buffer, used by tests and by
//!   stores that do not need to survive the process
//! - [`FileBackend`] - a single OS file
//!
//! ## Example
//!
//! ```rust
//! use treesync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut wal = InMemoryBackend::new();
//! let offset = wal.append(b"frame").unwrap();
//! assert_eq!(wal.read_at(offset, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
