//! Backup strategies for keepfile saves.
//!
//! [`FileBackuper`] keeps timestamped copies next to (or away from) the
//! target with count and age based retention. [`GitBackuper`] commits every
//! save instead.

pub mod file;
pub mod git;
pub mod settings;

pub use file::{BackupFile, FileBackuper};
pub use git::GitBackuper;
pub use settings::{
    BackupSettings, DEFAULT_BACKUP_EXTENSION, DEFAULT_BACKUP_SUBDIR, DEFAULT_TIMESTAMP_FORMAT,
};
