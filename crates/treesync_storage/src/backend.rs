//! Storage backend trait definition.

use crate::error::StorageResult;

/// An opaque byte store.
///
/// The local store frames its own records on top of this trait; a backend
/// only guarantees that bytes come back exactly as they were appended.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at
/// - `read_at` returns exactly the bytes previously written at that offset
/// - after `sync` returns, appended data survives process termination
/// - `replace` is all-or-nothing: readers see either the old or the new
///   contents, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends past
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads the whole contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }

    /// Appends data to the end and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is also the offset of the
    /// next append.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Drops everything after `new_size`.
    ///
    /// Used to cut a torn tail off the log during recovery and to empty the
    /// log after a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] if `new_size` is
    /// larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically swaps the whole contents for `data` and makes it durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the new contents could not be written; the old
    /// contents are left in place in that case.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
