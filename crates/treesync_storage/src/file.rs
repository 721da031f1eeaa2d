//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A backend over a single OS file.
///
/// `flush` hands data to the OS, `sync` calls `File::sync_all`. `replace`
/// writes a sibling `*.tmp` file, syncs it and renames it over the original,
/// so a crash mid-replace leaves the previous contents intact.
///
/// ```no_run
/// use treesync_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut wal = FileBackend::open(Path::new("nodes.wal")).unwrap();
/// wal.append(b"frame").unwrap();
/// wal.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<OpenFile>,
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    size: u64,
}

impl OpenFile {
    fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl FileBackend {
    /// Opens or creates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(OpenFile::open(path)?),
        })
    }

    /// Opens or creates the file, creating missing parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        inner.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.size;
        if data.is_empty() {
            return Ok(offset);
        }
        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(data)?;
        inner.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.lock().file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if new_size > inner.size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: inner.size,
            });
        }
        inner.file.set_len(new_size)?;
        inner.file.sync_all()?;
        inner.size = new_size;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let temp = self.temp_path();
        {
            let mut staged = File::create(&temp)?;
            staged.write_all(data)?;
            staged.sync_all()?;
        }

        let mut inner = self.inner.lock();
        fs::rename(&temp, &self.path)?;
        sync_parent_dir(&self.path)?;
        *inner = OpenFile::open(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            dir.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> StorageResult<()> {
    Ok(())
}
