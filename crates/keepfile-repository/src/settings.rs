//! Repository configuration.
//!
//! # Directory resolution
//!
//! [`default_directory`] picks, in order:
//! 1. `KEEPFILE_DIR` if set and non-empty
//! 2. `<platform config dir>/<app name>`
//! 3. `./<app name>`
//!
//! The result is never cached; callers thread the directory through
//! [`RepositorySettings`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keepfile_backup::{BackupSettings, DEFAULT_BACKUP_SUBDIR};
use keepfile_persistence::{PersistenceError, Result, SaveOptions, DEFAULT_TEMP_EXTENSION};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the data directory.
pub const DIRECTORY_ENV: &str = "KEEPFILE_DIR";

/// Application name used when none is given.
pub const DEFAULT_APP_NAME: &str = "keepfile";

/// Default extension of persisted files.
pub const DEFAULT_EXTENSION: &str = "json";

/// Resolves the data directory for `app_name`.
pub fn default_directory(app_name: &str) -> PathBuf {
    std::env::var_os(DIRECTORY_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .map(|dir| dir.join(app_name))
                .unwrap_or_else(|| PathBuf::from(".").join(app_name))
        })
}

/// Where and how a repository stores its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Directory holding one file per item.
    pub directory: PathBuf,
    /// Extension of item files, without the dot.
    pub extension: String,
    /// Extension of in-flight temp files, without the dot.
    pub temp_extension: String,
    /// Skip saves of items equal to their last persisted state.
    pub is_tracking_dirty: bool,
    /// Wait this long for a file lock instead of failing at once.
    pub lock_timeout: Option<Duration>,
    /// Timestamped backups; `None` disables them.
    pub backup_settings: Option<BackupSettings>,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self::new(default_directory(DEFAULT_APP_NAME))
    }
}

impl RepositorySettings {
    /// Settings for `directory` with every other value at its default.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            temp_extension: DEFAULT_TEMP_EXTENSION.to_string(),
            is_tracking_dirty: true,
            lock_timeout: None,
            backup_settings: None,
        }
    }

    /// Settings for `app_name`'s default directory.
    pub fn for_app(app_name: &str) -> Self {
        Self::new(default_directory(app_name))
    }

    /// Sets the item extension; a leading dot is ignored.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    /// Sets the temp extension; a leading dot is ignored.
    pub fn with_temp_extension(mut self, extension: impl Into<String>) -> Self {
        self.temp_extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_dirty_tracking(mut self, enabled: bool) -> Self {
        self.is_tracking_dirty = enabled;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_backups(mut self, backup_settings: BackupSettings) -> Self {
        self.backup_settings = Some(backup_settings);
        self
    }

    /// Options handed to every save transaction.
    pub fn save_options(&self) -> SaveOptions {
        let options = SaveOptions::new().with_temp_extension(self.temp_extension.clone());
        match self.lock_timeout {
            Some(timeout) => options.with_lock_timeout(timeout),
            None => options,
        }
    }

    /// Backup directory in use, if backups are on.
    pub fn backup_directory(&self) -> Option<PathBuf> {
        self.backup_settings.as_ref().map(|backup| {
            backup
                .directory
                .clone()
                .unwrap_or_else(|| self.directory.join(DEFAULT_BACKUP_SUBDIR))
        })
    }
}

/// Creates the data directory and, if backups are on, the backup directory.
///
/// # Errors
/// Returns `Directory` for the first directory that cannot be created.
pub fn ensure_directories(settings: &RepositorySettings) -> Result<()> {
    create_dir(&settings.directory)?;
    if let Some(backup_dir) = settings.backup_directory() {
        create_dir(&backup_dir)?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| PersistenceError::Directory {
        path: path.to_path_buf(),
        source,
    })
}
