//! Store directory layout and locking.
//!
//! ```text
//! <store>/
//! ├─ LOCK          # advisory lock, one process at a time
//! ├─ nodes.wal     # write-ahead log
//! └─ nodes.snap    # latest snapshot
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use treesync_storage::FileBackend;

const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "nodes.wal";
const SNAPSHOT_FILE: &str = "nodes.snap";

/// An open, exclusively locked store directory.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens (and optionally creates) the directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Locked`] if another process holds the store,
    /// or an invalid-operation error if the directory is missing and
    /// `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CoreError::invalid_operation(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "store path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the write-ahead log.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Opens both backends.
    pub(crate) fn open_backends(&self) -> CoreResult<(FileBackend, FileBackend)> {
        Ok((
            FileBackend::open(&self.wal_path())?,
            FileBackend::open(&self.snapshot_path())?,
        ))
    }
}

/// Returns the log and snapshot paths of a store at `path` without locking
/// it. Used by read-only diagnostics.
#[must_use]
pub fn store_files(path: &Path) -> (PathBuf, PathBuf) {
    (path.join(WAL_FILE), path.join(SNAPSHOT_FILE))
}
