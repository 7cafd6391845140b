//! The save transaction: lock, write to temp, back up, publish, clean up.
//!
//! For a target `dir/name.ext` a save touches three siblings:
//!
//! ```text
//! dir/
//! ├── name.ext        # target, locked for the whole save
//! ├── name.deleting   # sentinel, present only while a save is running
//! └── name.tmp        # temp, receives the new bytes before publish
//! ```
//!
//! The order of the steps is fixed:
//! lock target → lock sentinel → `before_save` → lock temp → write temp →
//! `backup` (only if the target existed) → rename temp over target →
//! release target → delete sentinel → `after_save`.
//!
//! Nothing about the target's content changes before the rename, so a
//! failure anywhere before it leaves the target exactly as it was.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::backuper::Backuper;
use crate::error::{FileOp, PersistenceError, Result};
use crate::locked_file::{Access, LockedFile, LOCK_RETRY_INTERVAL};

/// Extension of the sentinel file that marks a save in progress.
pub const SOFT_DELETE_EXTENSION: &str = "deleting";

/// Default extension of the temp file.
pub const DEFAULT_TEMP_EXTENSION: &str = "tmp";

/// Lock wait used by [`SaveTransaction::commit_async`] when no timeout is
/// configured.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const TARGET_OPEN_ATTEMPTS: usize = 8;

/// Knobs for a single save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    /// Extension (without the dot) of the temp sibling.
    pub temp_extension: String,
    /// When set, lock acquisition waits up to this long instead of failing
    /// on the first contention.
    pub lock_timeout: Option<Duration>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            temp_extension: DEFAULT_TEMP_EXTENSION.to_string(),
            lock_timeout: None,
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the temp extension; a leading dot is ignored.
    pub fn with_temp_extension(mut self, extension: impl Into<String>) -> Self {
        self.temp_extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// Path of the temp sibling used while saving `target`.
pub fn temp_path(target: &Path, temp_extension: &str) -> PathBuf {
    target.with_extension(temp_extension.trim_start_matches('.'))
}

/// Path of the sentinel sibling used while saving `target`.
pub fn sentinel_path(target: &Path) -> PathBuf {
    target.with_extension(SOFT_DELETE_EXTENSION)
}

type Payload<'w> = Box<dyn FnOnce(&mut dyn Write) -> Result<()> + 'w>;

/// One save of one file.
///
/// Dropping a transaction, committed or not, releases the target and
/// removes the temp and sentinel files it created.
pub struct SaveTransaction<'a> {
    target: PathBuf,
    temp: PathBuf,
    sentinel: PathBuf,
    backuper: &'a dyn Backuper,
    lock_timeout: Option<Duration>,
    existed_before: bool,
    target_lock: Option<LockedFile>,
    sentinel_lock: Option<LockedFile>,
    temp_lock: Option<LockedFile>,
}

impl<'a> SaveTransaction<'a> {
    /// Prepares a save of `target`. Nothing is touched until a commit.
    ///
    /// # Errors
    /// `InvalidOperation` if the temp or sentinel path would collide with
    /// the target itself.
    pub fn new(
        target: impl Into<PathBuf>,
        options: &SaveOptions,
        backuper: &'a dyn Backuper,
    ) -> Result<Self> {
        let target = target.into();
        let temp = temp_path(&target, &options.temp_extension);
        let sentinel = sentinel_path(&target);
        if temp == target || sentinel == target {
            return Err(PersistenceError::InvalidOperation(format!(
                "{} cannot be saved with temp extension '{}'",
                target.display(),
                options.temp_extension
            )));
        }

        Ok(Self {
            target,
            temp,
            sentinel,
            backuper,
            lock_timeout: options.lock_timeout,
            existed_before: false,
            target_lock: None,
            sentinel_lock: None,
            temp_lock: None,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }

    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    /// Saves whatever `write` produces.
    ///
    /// `write` streams straight into the temp file; the target is replaced
    /// only once it has returned successfully.
    pub fn commit<F>(self, write: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        self.run(Some(Box::new(write)))
    }

    /// Saves `bytes` verbatim.
    pub fn commit_bytes(self, bytes: &[u8]) -> Result<()> {
        let temp = self.temp.clone();
        self.commit(move |writer| {
            writer
                .write_all(bytes)
                .map_err(|source| PersistenceError::io(FileOp::Write, temp, source))
        })
    }

    /// Saves everything `reader` yields.
    pub fn commit_from_reader<R: Read>(self, reader: &mut R) -> Result<()> {
        let temp = self.temp.clone();
        self.commit(move |writer| {
            std::io::copy(reader, writer)
                .map(|_| ())
                .map_err(|source| PersistenceError::io(FileOp::Write, temp, source))
        })
    }

    /// Removes the target, backing it up first if it existed.
    pub fn commit_delete(self) -> Result<()> {
        self.run(None)
    }

    /// Stream variant: copies `reader` into the temp file on the tokio
    /// runtime. Locks are awaited with a timeout instead of failing fast.
    pub async fn commit_async<R>(mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let timeout = self.lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT);
        self.prepare()?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_lock_target() {
                Ok(locked) => break self.hold_target(locked),
                Err(PersistenceError::Locked { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(PersistenceError::Locked { path, .. }) => {
                    return Err(PersistenceError::Timeout { path, timeout });
                }
                Err(e) => return Err(e),
            }
        }
        self.sentinel_lock =
            Some(LockedFile::open_async(&self.sentinel, Access::Hold, timeout).await?);
        self.backuper.before_save(&self.target)?;

        let mut temp = LockedFile::open_async(&self.temp, Access::Write, timeout).await?;
        let handle = temp
            .file_mut()?
            .try_clone()
            .map_err(|source| PersistenceError::io(FileOp::Open, &self.temp, source))?;
        self.temp_lock = Some(temp);

        let mut file = tokio::fs::File::from_std(handle);
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|source| PersistenceError::io(FileOp::Write, &self.temp, source))?;
        file.flush()
            .await
            .map_err(|source| PersistenceError::io(FileOp::Write, &self.temp, source))?;
        file.sync_all()
            .await
            .map_err(|source| PersistenceError::io(FileOp::Sync, &self.temp, source))?;
        drop(file);

        self.after_copy(true)
    }

    fn run(mut self, payload: Option<Payload<'_>>) -> Result<()> {
        let writing = payload.is_some();
        self.before_copy(writing)?;
        if let Some(write) = payload {
            self.write_temp(write)?;
        }
        self.after_copy(writing)
    }

    fn prepare(&mut self) -> Result<()> {
        if let Some(parent) = self.target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| PersistenceError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// One attempt at locking the target. The flag tells whether the file
    /// was there before or was created by this attempt.
    fn try_lock_target(&self) -> Result<(LockedFile, bool)> {
        let mut create = OpenOptions::new();
        create.read(true).write(true).create_new(true);
        let mut existing = OpenOptions::new();
        existing.read(true).write(true);

        // Another process may create or delete the target between the two
        // opens; each loop settles one way or the other.
        for _ in 0..TARGET_OPEN_ATTEMPTS {
            match LockedFile::open_with(&self.target, &create) {
                Ok(locked) => return Ok((locked, false)),
                Err(PersistenceError::Io { source, .. })
                    if source.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            match LockedFile::open_with(&self.target, &existing) {
                Ok(locked) => return Ok((locked, true)),
                Err(PersistenceError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Err(PersistenceError::Locked {
            path: self.target.clone(),
            source: std::io::Error::new(
                ErrorKind::WouldBlock,
                "target keeps appearing and disappearing",
            ),
        })
    }

    fn lock_target(&mut self) -> Result<()> {
        let Some(timeout) = self.lock_timeout else {
            let locked = self.try_lock_target()?;
            self.hold_target(locked);
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        loop {
            match self.try_lock_target() {
                Ok(locked) => {
                    self.hold_target(locked);
                    return Ok(());
                }
                Err(PersistenceError::Locked { .. }) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(PersistenceError::Locked { path, .. }) => {
                    debug!(path = %path.display(), ?timeout, "Gave up waiting for target lock");
                    return Err(PersistenceError::Timeout { path, timeout });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn hold_target(&mut self, (locked, existed): (LockedFile, bool)) {
        self.existed_before = existed;
        self.target_lock = Some(locked);
    }

    fn lock(&self, path: &Path, access: Access) -> Result<LockedFile> {
        match self.lock_timeout {
            Some(timeout) => LockedFile::open_with_timeout(path, access, timeout),
            None => LockedFile::open(path, access),
        }
    }

    fn before_copy(&mut self, writing: bool) -> Result<()> {
        self.prepare()?;
        self.lock_target()?;
        self.sentinel_lock = Some(self.lock(&self.sentinel, Access::Hold)?);
        self.backuper.before_save(&self.target)?;
        if writing {
            self.temp_lock = Some(self.lock(&self.temp, Access::Write)?);
        }
        debug!(
            path = %self.target.display(),
            existed = self.existed_before,
            "Save transaction prepared"
        );
        Ok(())
    }

    fn write_temp(&mut self, write: Payload<'_>) -> Result<()> {
        let temp_path = self.temp.clone();
        let temp = self.temp_lock.as_mut().ok_or_else(|| {
            PersistenceError::InvalidOperation("temp file is not locked".to_string())
        })?;

        {
            let mut writer = BufWriter::new(temp.file_mut()?);
            write(&mut writer)?;
            writer
                .flush()
                .map_err(|source| PersistenceError::io(FileOp::Write, &temp_path, source))?;
        }
        temp.sync()
    }

    fn after_copy(&mut self, writing: bool) -> Result<()> {
        if self.existed_before {
            if let Some(target) = self.target_lock.as_mut() {
                self.backuper.backup(target)?;
            }
        }

        if let Err(original) = self.publish(writing) {
            return Err(self.roll_back(original));
        }

        if let Err(e) = self.backuper.after_save(&self.target) {
            warn!(path = %self.target.display(), error = %e, "Post-save backup hook failed");
        }

        info!(
            path = %self.target.display(),
            deleted = !writing,
            "Save committed"
        );
        Ok(())
    }

    fn publish(&mut self, writing: bool) -> Result<()> {
        if !writing {
            if let Some(target) = self.target_lock.take() {
                target.dispose_and_delete();
            }
        } else {
            // The rename replaces the file atomically, so readers never see
            // the path missing. Unix keeps the old file locked until the
            // new one is in place; elsewhere it must be closed first.
            if cfg!(not(unix)) {
                if let Some(target) = self.target_lock.as_mut() {
                    target.close();
                }
            }
            fs::rename(&self.temp, &self.target)
                .map_err(|source| PersistenceError::io(FileOp::Move, &self.temp, source))?;
            if let Some(mut target) = self.target_lock.take() {
                target.close();
            }
            if let Some(temp) = self.temp_lock.take() {
                temp.dispose_and_delete();
            }
        }

        if let Some(sentinel) = self.sentinel_lock.take() {
            sentinel.dispose_and_delete();
        }
        Ok(())
    }

    /// Undo path for a failed publish. Returns the error to report.
    fn roll_back(&mut self, original: PersistenceError) -> PersistenceError {
        if !self.existed_before {
            if let Err(e) = fs::remove_file(&self.target) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.target.display(), error = %e, "Failed to remove orphaned target");
                }
            }
            return original;
        }

        match self.backuper.try_restore(&self.target) {
            Ok(restored) => {
                warn!(
                    path = %self.target.display(),
                    restored,
                    error = %original,
                    "Save failed during publish"
                );
                original
            }
            Err(restore) => PersistenceError::RestoreFailed {
                path: self.target.clone(),
                original: Box::new(original),
                restore: Box::new(restore),
            },
        }
    }
}

impl Drop for SaveTransaction<'_> {
    fn drop(&mut self) {
        if let Some(mut target) = self.target_lock.take() {
            if self.existed_before {
                target.close();
            } else {
                // Placeholder created by this transaction.
                target.dispose_and_delete();
            }
        }
        if let Some(sentinel) = self.sentinel_lock.take() {
            sentinel.dispose_and_delete();
        }
        if let Some(temp) = self.temp_lock.take() {
            temp.dispose_and_delete();
        }
    }
}

/// What [`recover_stale_artifacts`] found next to a target.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// A leftover temp file was deleted.
    pub removed_temp: bool,
    /// A leftover sentinel was deleted.
    pub removed_sentinel: bool,
    /// A live transaction owns the sentinel; nothing was touched.
    pub in_progress: bool,
}

/// Cleans up after a save that crashed mid-way.
///
/// A sentinel that nobody holds a lock on is a leftover of a dead process;
/// the temp file next to it never got published and is removed together with
/// the sentinel. The target itself is never modified.
pub fn recover_stale_artifacts(target: &Path, options: &SaveOptions) -> Result<RecoveryReport> {
    let sentinel = sentinel_path(target);
    let mut report = RecoveryReport::default();
    if !sentinel.exists() {
        return Ok(report);
    }

    let sentinel_lock = match LockedFile::open(&sentinel, Access::Hold) {
        Ok(lock) => lock,
        Err(PersistenceError::Locked { .. }) => {
            debug!(path = %target.display(), "Save in progress, skipping recovery");
            report.in_progress = true;
            return Ok(report);
        }
        Err(e) => return Err(e),
    };

    let temp = temp_path(target, &options.temp_extension);
    if temp.exists() {
        fs::remove_file(&temp).map_err(|source| PersistenceError::io(FileOp::Delete, &temp, source))?;
        report.removed_temp = true;
    }
    sentinel_lock.dispose_and_delete();
    report.removed_sentinel = true;

    warn!(
        path = %target.display(),
        removed_temp = report.removed_temp,
        "Recovered from interrupted save"
    );
    Ok(report)
}
