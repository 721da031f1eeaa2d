//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A byte buffer held in memory.
///
/// Clones share the same buffer. Tests use this to "restart" a store: keep
/// a clone of the backend, drop the store, and open a new store over the
/// clone to exercise recovery without touching the file system.
///
/// ```rust
/// use treesync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let shared = backend.clone();
/// backend.append(b"abc").unwrap();
/// assert_eq!(shared.size().unwrap(), 3);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the current contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Overwrites a single byte in place. Used to simulate media corruption.
    ///
    /// Out-of-range offsets are ignored.
    pub fn flip_byte(&self, offset: usize) {
        if let Some(byte) = self.data.write().get_mut(offset) {
            *byte ^= 0xFF;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn read_all(&self) -> StorageResult<Vec<u8>> {
        Ok(self.data())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> StorageResult<()> {
        *self.data.write() = bytes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(10, 0),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn clones_share_contents() {
        let mut backend = InMemoryBackend::new();
        let other = backend.clone();
        backend.append(b"shared").unwrap();
        assert_eq!(other.read_all().unwrap(), b"shared");

        drop(backend);
        assert_eq!(other.size().unwrap(), 6);
    }

    #[test]
    fn truncate_shrinks_but_never_grows() {
        let mut backend = InMemoryBackend::with_data(b"hello world".to_vec());
        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::InvalidTruncate { requested: 100, size: 5 })
        ));
    }

    #[test]
    fn replace_swaps_contents() {
        let mut backend = InMemoryBackend::with_data(b"old contents".to_vec());
        backend.replace(b"new").unwrap();
        assert_eq!(backend.read_all().unwrap(), b"new");
    }

    #[test]
    fn flip_byte_corrupts_in_place() {
        let backend = InMemoryBackend::with_data(vec![0x00, 0x0F]);
        backend.flip_byte(1);
        backend.flip_byte(99);
        assert_eq!(backend.data(), vec![0x00, 0xF0]);
    }
}
