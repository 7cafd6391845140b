//! Backup retention settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default backup file extension (without the dot).
pub const DEFAULT_BACKUP_EXTENSION: &str = "bak";

/// Default timestamp embedded in backup file names.
///
/// Only characters that are valid in file names on every platform.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S%.3f";

/// Subdirectory of the target's directory used when no backup directory is
/// configured.
pub const DEFAULT_BACKUP_SUBDIR: &str = "backup";

/// How many backups to keep, where, and for how long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Where backups go; `None` means a `backup/` folder next to the target.
    pub directory: Option<PathBuf>,
    /// Backup file extension.
    pub extension: String,
    /// chrono format string for the timestamp part of backup names. It has
    /// to parse back, so it must contain at least a full date.
    pub timestamp_format: String,
    /// Backups kept per target, newest first. Zero keeps all of them.
    pub number_of_backups: usize,
    /// Backups older than this are pruned.
    pub max_age_in_days: Option<u32>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            directory: None,
            extension: DEFAULT_BACKUP_EXTENSION.to_string(),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            number_of_backups: 3,
            max_age_in_days: None,
        }
    }
}

impl BackupSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Sets the extension; a leading dot is ignored.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = format.into();
        self
    }

    pub fn with_number_of_backups(mut self, count: usize) -> Self {
        self.number_of_backups = count;
        self
    }

    pub fn with_max_age_in_days(mut self, days: u32) -> Self {
        self.max_age_in_days = Some(days);
        self
    }
}
