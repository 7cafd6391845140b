//! Locked file handles: the unit of mutual exclusion.
//!
//! A [`LockedFile`] keeps an OS handle open for one path and holds an
//! exclusive advisory lock on it. The lock is what other transactions (in
//! this process or another one) collide with; it does not stop readers from
//! opening the path, nor does it stop the path from being renamed over or
//! unlinked while held.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, trace, warn};

use crate::error::{FileOp, PersistenceError, Result};

/// Pause between attempts when waiting for a lock.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// How a [`LockedFile`] opens its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only; the path must already exist.
    Observe,
    /// Read-write, created if missing, never truncated.
    Hold,
    /// Write-only, created if missing, truncated once the lock is held.
    Write,
}

impl Access {
    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            Access::Observe => {
                options.read(true);
            }
            Access::Hold => {
                options.read(true).write(true).create(true);
            }
            Access::Write => {
                options.write(true).create(true);
            }
        }
        options
    }
}

/// An open, exclusively locked handle for exactly one path.
#[derive(Debug)]
pub struct LockedFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockedFile {
    /// Opens `path` with `access` and takes the lock, failing immediately on
    /// contention.
    pub fn open(path: impl Into<PathBuf>, access: Access) -> Result<Self> {
        let path = path.into();
        let mut locked = Self::open_with(path, &access.options())?;
        if access == Access::Write {
            locked.truncate()?;
        }
        Ok(locked)
    }

    /// Opens `path` with caller-built options and takes the lock.
    pub fn open_with(path: impl Into<PathBuf>, options: &OpenOptions) -> Result<Self> {
        let path = path.into();
        let file = options
            .open(&path)
            .map_err(|source| PersistenceError::io(FileOp::Open, &path, source))?;

        if let Err(source) = FileExt::try_lock_exclusive(&file) {
            if source.kind() == fs2::lock_contended_error().kind() {
                return Err(PersistenceError::Locked { path, source });
            }
            return Err(PersistenceError::io(FileOp::Open, path, source));
        }

        // Whoever held the lock may have replaced or unlinked the path
        // before releasing it; a lock on the orphaned file guards nothing.
        if !still_at_path(&file, &path) {
            let _ = FileExt::unlock(&file);
            return Err(PersistenceError::Locked {
                path,
                source: std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "path was replaced while acquiring its lock",
                ),
            });
        }

        trace!(path = %path.display(), "Locked file");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Like [`LockedFile::open`], but keeps retrying while the path is locked
    /// by someone else, until `timeout` has elapsed.
    pub fn open_with_timeout(
        path: impl Into<PathBuf>,
        access: Access,
        timeout: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let deadline = Instant::now() + timeout;
        loop {
            match Self::open(path.clone(), access) {
                Err(PersistenceError::Locked { .. }) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(PersistenceError::Locked { .. }) => {
                    debug!(path = %path.display(), ?timeout, "Gave up waiting for lock");
                    return Err(PersistenceError::Timeout { path, timeout });
                }
                other => return other,
            }
        }
    }

    /// Async form of [`LockedFile::open_with_timeout`]; sleeps on the tokio
    /// timer between attempts instead of blocking the thread.
    pub async fn open_async(
        path: impl Into<PathBuf>,
        access: Access,
        timeout: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let deadline = Instant::now() + timeout;
        loop {
            match Self::open(path.clone(), access) {
                Err(PersistenceError::Locked { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(PersistenceError::Locked { .. }) => {
                    debug!(path = %path.display(), ?timeout, "Gave up waiting for lock");
                    return Err(PersistenceError::Timeout { path, timeout });
                }
                other => return other,
            }
        }
    }

    /// The locked path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until [`LockedFile::close`] has been called.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// The underlying handle.
    pub fn file_mut(&mut self) -> Result<&mut File> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| {
            PersistenceError::io(
                FileOp::Read,
                path,
                std::io::Error::new(std::io::ErrorKind::Other, "handle already closed"),
            )
        })
    }

    /// Reads the whole content through the held handle.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let file = self.file_mut()?;
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut data))
            .map_err(|source| PersistenceError::io(FileOp::Read, path, source))?;
        Ok(data)
    }

    fn truncate(&mut self) -> Result<()> {
        let path = self.path.clone();
        self.file_mut()?
            .set_len(0)
            .map_err(|source| PersistenceError::io(FileOp::Write, path, source))
    }

    /// Flushes file content to disk.
    pub fn sync(&mut self) -> Result<()> {
        let path = self.path.clone();
        self.file_mut()?
            .sync_all()
            .map_err(|source| PersistenceError::io(FileOp::Sync, path, source))
    }

    /// Releases the lock and the handle without touching the path.
    ///
    /// Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            trace!(path = %self.path.display(), "Released file lock");
        }
    }

    /// Deletes the path and closes the handle.
    ///
    /// On Unix the path is unlinked while the lock is still held, so no
    /// waiter can lock the file between release and delete. Elsewhere the
    /// handle is closed first because open files cannot be unlinked. A
    /// failed delete is logged and otherwise ignored.
    pub fn dispose_and_delete(mut self) {
        if cfg!(not(unix)) {
            self.close();
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "Deleted file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to delete file"),
        }
        self.close();
    }
}

/// Whether `path` still names the file behind `file`.
#[cfg(unix)]
fn still_at_path(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_at_path(_file: &File, path: &Path) -> bool {
    path.exists()
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        self.close();
    }
}
