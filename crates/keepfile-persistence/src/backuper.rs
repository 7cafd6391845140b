//! The backup contract consumed by save and rename transactions.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::locked_file::LockedFile;
use crate::rename_transaction::RenamePair;

/// Pluggable snapshot/restore strategy around a save.
///
/// A [`crate::SaveTransaction`] calls the hooks in a fixed order:
/// `before_save`, then `backup` (only when the target already existed, with
/// the target's still-open handle), then `after_save` once the new content
/// is published. `try_restore` is the undo path used when publishing fails.
pub trait Backuper: Send + Sync {
    /// Called before anything is written. The return value is informational.
    fn before_save(&self, target: &Path) -> Result<bool>;

    /// Captures the current on-disk bytes of `target` through its held handle.
    fn backup(&self, target: &mut LockedFile) -> Result<()>;

    /// Copies `target` to an explicit `backup_path`.
    fn backup_to(&self, target: &Path, backup_path: &Path) -> Result<()>;

    /// Called once new content is durably in place at `target`.
    fn after_save(&self, target: &Path) -> Result<()>;

    /// Whether a backup exists that could replace `target`.
    fn can_restore(&self, target: &Path) -> bool;

    /// Replaces `target` with the most recent backup.
    ///
    /// Returns `Ok(false)` when there is nothing to restore.
    fn try_restore(&self, target: &Path) -> Result<bool>;

    /// Whether the backups of `target` can follow a rename to `new_path`.
    fn can_rename(&self, target: &Path, new_path: &Path) -> bool;

    /// Renames the backups of `target` so they belong to `new_path`.
    ///
    /// Also called after a transaction that already moved the
    /// [`Backuper::rename_pairs`], so it must only act on what is left.
    fn rename(&self, target: &Path, new_path: &Path, overwrite: bool) -> Result<()>;

    /// The backup files that must move alongside a rename of `target`.
    fn rename_pairs(&self, target: &Path, new_path: &Path) -> Vec<RenamePair<PathBuf>>;

    /// Removes every backup of `target`.
    fn delete_backups(&self, target: &Path) -> Result<()>;
}

/// A backuper that keeps nothing and therefore can never restore.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackuper;

impl Backuper for NullBackuper {
    fn before_save(&self, _target: &Path) -> Result<bool> {
        Ok(false)
    }

    fn backup(&self, _target: &mut LockedFile) -> Result<()> {
        Ok(())
    }

    fn backup_to(&self, _target: &Path, _backup_path: &Path) -> Result<()> {
        Ok(())
    }

    fn after_save(&self, _target: &Path) -> Result<()> {
        Ok(())
    }

    fn can_restore(&self, _target: &Path) -> bool {
        false
    }

    fn try_restore(&self, _target: &Path) -> Result<bool> {
        Ok(false)
    }

    fn can_rename(&self, _target: &Path, _new_path: &Path) -> bool {
        true
    }

    fn rename(&self, _target: &Path, _new_path: &Path, _overwrite: bool) -> Result<()> {
        Ok(())
    }

    fn rename_pairs(&self, _target: &Path, _new_path: &Path) -> Vec<RenamePair<PathBuf>> {
        Vec::new()
    }

    fn delete_backups(&self, _target: &Path) -> Result<()> {
        Ok(())
    }
}
