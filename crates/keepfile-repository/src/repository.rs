//! One-file-per-item repository.
//!
//! Items live as `<directory>/<name>.<extension>`:
//!
//! ```text
//! directory/
//! ├── settings.json
//! ├── profile.json
//! └── backup/            # only with backups enabled
//!     └── settings.json.2026-10-18_09-15-02.417.bak
//! ```
//!
//! Reads hand out shared `Arc<RwLock<T>>` instances, one per file while any
//! caller keeps it alive. Saves go through a [`SaveTransaction`] and are
//! skipped when the item still equals its last persisted state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use keepfile_backup::FileBackuper;
use keepfile_persistence::atomic::read_file_optional;
use keepfile_persistence::{
    recover_stale_artifacts, Backuper, DirtyTracker, FileOp, NullBackuper, PersistenceError,
    RenamePair, RenameTransaction, Result, SaveOptions, SaveTransaction, Serializer,
};
use tracing::{debug, info, warn};

use crate::cache::InstanceCache;
use crate::settings::RepositorySettings;

type Migration<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// What a save did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The file was written.
    Saved,
    /// The item equals its last persisted state; nothing was written.
    Unchanged,
}

/// Typed facade over save and rename transactions, the dirty tracker and the
/// instance cache.
pub struct Repository<T, S> {
    settings: RepositorySettings,
    options: SaveOptions,
    serializer: Arc<S>,
    backuper: Arc<dyn Backuper>,
    tracker: DirtyTracker<T>,
    cache: InstanceCache<T>,
    migration: Option<Migration<T>>,
}

impl<T, S> Repository<T, S>
where
    T: 'static,
    S: Serializer<T> + 'static,
{
    /// Creates a repository. Backups are taken with a [`FileBackuper`] when
    /// `settings.backup_settings` is set.
    pub fn new(settings: RepositorySettings, serializer: S) -> Self {
        let backuper: Arc<dyn Backuper> = match &settings.backup_settings {
            Some(backup) => Arc::new(FileBackuper::new(backup.clone())),
            None => Arc::new(NullBackuper),
        };
        let serializer = Arc::new(serializer);
        let tracked: Arc<dyn Serializer<T>> = serializer.clone();

        Self {
            options: settings.save_options(),
            settings,
            serializer,
            backuper,
            tracker: DirtyTracker::new(tracked),
            cache: InstanceCache::new(),
            migration: None,
        }
    }

    /// Replaces the backup strategy.
    pub fn with_backuper(mut self, backuper: Arc<dyn Backuper>) -> Self {
        self.backuper = backuper;
        self
    }

    /// Runs `migrate` on every freshly loaded item. The baseline is tracked
    /// before migration, so a migrated item reads as dirty until saved.
    pub fn with_migration<F>(mut self, migrate: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.migration = Some(Box::new(migrate));
        self
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    pub fn backuper(&self) -> &Arc<dyn Backuper> {
        &self.backuper
    }

    /// Baselines of the last persisted states.
    pub fn tracker(&self) -> &DirtyTracker<T> {
        &self.tracker
    }

    /// Live shared instances.
    pub fn cache(&self) -> &InstanceCache<T> {
        &self.cache
    }

    /// File that stores `name`. A name already ending in the extension is
    /// used as is.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let has_extension = Path::new(name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(self.settings.extension.as_str()));
        if has_extension {
            self.settings.directory.join(name)
        } else {
            self.settings
                .directory
                .join(format!("{}.{}", name, self.settings.extension))
        }
    }

    /// The shared instance for `name`, loading it from disk if no caller
    /// holds one.
    ///
    /// # Errors
    /// `NotFound` if the file does not exist; serializer and IO errors as
    /// they occur.
    pub fn read(&self, name: &str) -> Result<Arc<RwLock<T>>> {
        let path = self.path_for(name);
        let (instance, _) = self
            .cache
            .get_or_try_insert_with(&path, || self.load(&path, name))?;
        Ok(instance)
    }

    /// Like [`Repository::read`], but a missing file yields `T::default()`.
    /// The default is cached but has no baseline, so it is dirty.
    pub fn read_or_default(&self, name: &str) -> Result<Arc<RwLock<T>>>
    where
        T: Default,
    {
        let path = self.path_for(name);
        let (instance, _) = self.cache.get_or_try_insert_with(&path, || {
            match self.load(&path, name) {
                Err(PersistenceError::NotFound { .. }) => {
                    debug!(path = %path.display(), "No file, using default");
                    Ok(T::default())
                }
                other => other,
            }
        })?;
        Ok(instance)
    }

    /// Every item in the directory, sorted by name.
    ///
    /// Files that fail to load are logged and skipped.
    pub fn read_all(&self) -> Result<Vec<(String, Arc<RwLock<T>>)>> {
        let dir = &self.settings.directory;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries =
            fs::read_dir(dir).map_err(|source| PersistenceError::io(FileOp::Read, dir, source))?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| PersistenceError::io(FileOp::Read, dir, source))?
                .path();
            let matches = path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(self.settings.extension.as_str()));
            if !matches {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().into_owned());
            }
        }
        names.sort();

        let mut items = Vec::with_capacity(names.len());
        for name in names {
            match self.read(&name) {
                Ok(item) => items.push((name, item)),
                Err(e) => warn!(name = %name, error = %e, "Failed to load item"),
            }
        }
        Ok(items)
    }

    /// Persists `item` as `name`.
    ///
    /// With dirty tracking on, an item equal to its baseline is not written.
    pub fn save(&self, name: &str, item: &T) -> Result<SaveOutcome> {
        let path = self.path_for(name);
        if self.settings.is_tracking_dirty && !self.tracker.is_dirty_with_serializer(item, &path) {
            debug!(path = %path.display(), "Item unchanged, skipping save");
            return Ok(SaveOutcome::Unchanged);
        }

        let serializer = Arc::clone(&self.serializer);
        SaveTransaction::new(&path, &self.options, self.backuper.as_ref())?
            .commit(|writer| serializer.serialize_into(item, writer))?;

        if self.settings.is_tracking_dirty {
            self.tracker.track(&path, item)?;
        }
        Ok(SaveOutcome::Saved)
    }

    /// Persists a shared instance and makes it the cached one for `name`.
    pub fn save_shared(&self, name: &str, instance: &Arc<RwLock<T>>) -> Result<SaveOutcome> {
        let outcome = {
            let item = instance
                .read()
                .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
            self.save(name, &item)?
        };
        self.cache.insert(&self.path_for(name), instance)?;
        Ok(outcome)
    }

    /// Deletes the file for `name` and forgets it. Backups are kept.
    ///
    /// Returns false if there was no file.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name);
        let existed = path.is_file();
        if existed {
            SaveTransaction::new(&path, &self.options, self.backuper.as_ref())?.commit_delete()?;
        }
        self.forget(&path)?;
        Ok(existed)
    }

    /// Renames `old` to `new` together with its backups, all or nothing.
    ///
    /// # Errors
    /// Without `overwrite`, `InvalidOperation` if the file or one of its
    /// backups would land on an existing path.
    pub fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<()> {
        let old_path = self.path_for(old);
        let new_path = self.path_for(new);
        if !overwrite && !self.backuper.can_rename(&old_path, &new_path) {
            return Err(PersistenceError::InvalidOperation(format!(
                "backups of {} cannot be renamed to {}",
                old_path.display(),
                new_path.display()
            )));
        }

        let mut pairs = vec![RenamePair::new(old_path.clone(), new_path.clone())];
        pairs.extend(self.backuper.rename_pairs(&old_path, &new_path));
        RenameTransaction::new(pairs).commit(overwrite)?;

        // The files have moved; the keys follow them whatever the backuper
        // reports next.
        self.tracker.rename(&old_path, &new_path, true)?;
        self.cache.rename(&old_path, &new_path)?;
        info!(from = %old_path.display(), to = %new_path.display(), "Renamed item");

        // Covers whatever the pairs did not, e.g. recording the move in git.
        self.backuper.rename(&old_path, &new_path, overwrite)
    }

    /// Whether `item` differs from the last persisted state of `name`.
    pub fn is_dirty(&self, name: &str, item: &T) -> bool {
        self.tracker.is_dirty_with_serializer(item, &self.path_for(name))
    }

    /// Drops the cached instance and baseline of `name`. Live instances stay
    /// valid but the next read loads a new one.
    pub fn uncache(&self, name: &str) -> Result<()> {
        self.forget(&self.path_for(name))
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()?;
        self.tracker.clear()
    }

    pub fn can_restore(&self, name: &str) -> bool {
        self.backuper.can_restore(&self.path_for(name))
    }

    /// Puts the newest backup of `name` back in place and evicts the cached
    /// instance. Returns false if there was nothing to restore.
    pub fn restore(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name);
        let restored = self.backuper.try_restore(&path)?;
        if restored {
            self.forget(&path)?;
            info!(path = %path.display(), "Restored item from backup");
        }
        Ok(restored)
    }

    fn forget(&self, path: &Path) -> Result<()> {
        self.cache.remove(path)?;
        self.tracker.remove(path)
    }

    fn load(&self, path: &Path, name: &str) -> Result<T> {
        let recovery = recover_stale_artifacts(path, &self.options)?;
        if recovery.in_progress {
            debug!(path = %path.display(), "Reading while a save is in flight");
        }

        let bytes = read_file_optional(path)?.ok_or_else(|| PersistenceError::NotFound {
            kind: "item".to_string(),
            id: name.to_string(),
        })?;
        let mut item = self.serializer.deserialize(&bytes)?;

        if self.settings.is_tracking_dirty {
            self.tracker.track(path, &item)?;
        }
        if let Some(migrate) = &self.migration {
            migrate(&mut item);
        }
        Ok(item)
    }
}
