//! Timestamped backup copies with retention.
//!
//! Backups of `dir/name.ext` are stored as:
//!
//! ```text
//! <backup dir>/
//! ├── name.ext.2026-10-18_09-15-02.417.bak
//! └── name.ext.2026-10-17_18-40-55.006.bak
//! ```
//!
//! where `<backup dir>` is the configured directory or `dir/backup/`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use keepfile_persistence::atomic::{atomic_copy, atomic_write};
use keepfile_persistence::{
    Backuper, FileOp, LockedFile, PersistenceError, RenamePair, RenameTransaction, Result,
};
use tracing::{debug, info, warn};

use crate::settings::{BackupSettings, DEFAULT_BACKUP_SUBDIR};

/// One backup on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: PathBuf,
    /// Part of the file name between the target name and the extension.
    pub stamp: String,
    pub taken_at: NaiveDateTime,
}

/// Keeps timestamped copies of a file before it is overwritten.
#[derive(Debug, Clone, Default)]
pub struct FileBackuper {
    settings: BackupSettings,
}

impl FileBackuper {
    pub fn new(settings: BackupSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Directory holding the backups of `target`.
    pub fn backup_dir(&self, target: &Path) -> PathBuf {
        match &self.settings.directory {
            Some(dir) => dir.clone(),
            None => target
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(DEFAULT_BACKUP_SUBDIR),
        }
    }

    fn file_name(target: &Path) -> Result<String> {
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PersistenceError::InvalidOperation(format!(
                    "{} has no file name to back up",
                    target.display()
                ))
            })
    }

    fn backup_name(&self, file_name: &str, stamp: &str) -> String {
        format!("{}.{}.{}", file_name, stamp, self.settings.extension)
    }

    /// Picks a fresh backup path for `target`, stamped with the current time.
    fn next_backup_path(&self, target: &Path) -> Result<PathBuf> {
        let file_name = Self::file_name(target)?;
        let dir = self.backup_dir(target);
        let stamp = Local::now()
            .naive_local()
            .format(&self.settings.timestamp_format)
            .to_string();

        let mut candidate = dir.join(self.backup_name(&file_name, &stamp));
        let mut counter = 1;
        while candidate.exists() {
            candidate = dir.join(self.backup_name(&file_name, &format!("{stamp}-{counter}")));
            counter += 1;
        }
        Ok(candidate)
    }

    fn parse_stamp(&self, stamp: &str) -> Option<NaiveDateTime> {
        let format = self.settings.timestamp_format.as_str();
        let parse = |text: &str| {
            NaiveDateTime::parse_from_str(text, format).ok().or_else(|| {
                NaiveDate::parse_from_str(text, format)
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })
        };

        parse(stamp).or_else(|| {
            let (head, counter) = stamp.rsplit_once('-')?;
            if counter.chars().all(|c| c.is_ascii_digit()) {
                parse(head)
            } else {
                None
            }
        })
    }

    /// Local modification time, for stamps the format cannot parse back.
    fn modified_at(entry: &fs::DirEntry) -> Option<NaiveDateTime> {
        let modified = entry.metadata().ok()?.modified().ok()?;
        Some(DateTime::<Local>::from(modified).naive_local())
    }

    /// Backups of `target`, newest first. A stamp that does not parse with
    /// the timestamp format falls back to the file's modification time.
    pub fn backups_for(&self, target: &Path) -> Result<Vec<BackupFile>> {
        let dir = self.backup_dir(target);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}.", Self::file_name(target)?.to_lowercase());
        let suffix = format!(".{}", self.settings.extension.to_lowercase());

        let entries =
            fs::read_dir(&dir).map_err(|source| PersistenceError::io(FileOp::Read, &dir, source))?;

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PersistenceError::io(FileOp::Read, &dir, source))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let lowered = name.to_lowercase();
            if !lowered.starts_with(&prefix) || !lowered.ends_with(&suffix) {
                continue;
            }
            let Some(stamp) = name
                .get(prefix.len()..name.len().saturating_sub(suffix.len()))
                .filter(|stamp| !stamp.is_empty())
            else {
                continue;
            };
            let Some(taken_at) = self
                .parse_stamp(stamp)
                .or_else(|| Self::modified_at(&entry))
            else {
                debug!(path = %path.display(), "Ignoring backup without a usable timestamp");
                continue;
            };
            backups.push(BackupFile {
                path,
                stamp: stamp.to_string(),
                taken_at,
            });
        }

        backups.sort_by(|a, b| {
            b.taken_at
                .cmp(&a.taken_at)
                .then_with(|| b.stamp.len().cmp(&a.stamp.len()))
                .then_with(|| b.stamp.cmp(&a.stamp))
        });
        Ok(backups)
    }

    /// Removes backups beyond the retention count or past the maximum age.
    ///
    /// Returns how many were removed. Individual delete failures are logged.
    pub fn prune(&self, target: &Path) -> Result<usize> {
        let backups = self.backups_for(target)?;
        let cutoff = self
            .settings
            .max_age_in_days
            .and_then(|days| {
                // An age too large to subtract from now means no cutoff.
                ChronoDuration::try_days(i64::from(days))
                    .and_then(|age| Local::now().naive_local().checked_sub_signed(age))
            });

        let mut removed = 0;
        for (index, backup) in backups.iter().enumerate() {
            let over_count =
                self.settings.number_of_backups > 0 && index >= self.settings.number_of_backups;
            let too_old = cutoff.is_some_and(|cutoff| backup.taken_at < cutoff);
            if !over_count && !too_old {
                continue;
            }

            match fs::remove_file(&backup.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %backup.path.display(), error = %e, "Failed to prune backup"),
            }
        }

        if removed > 0 {
            debug!(path = %target.display(), removed, "Pruned old backups");
        }
        Ok(removed)
    }
}

impl Backuper for FileBackuper {
    fn before_save(&self, _target: &Path) -> Result<bool> {
        Ok(false)
    }

    fn backup(&self, target: &mut LockedFile) -> Result<()> {
        let data = target.read_all()?;
        let backup_path = self.next_backup_path(target.path())?;
        atomic_write(&backup_path, &data)?;
        info!(
            path = %target.path().display(),
            backup = %backup_path.display(),
            "Backed up file"
        );

        if let Err(e) = self.prune(target.path()) {
            warn!(path = %target.path().display(), error = %e, "Failed to prune backups");
        }
        Ok(())
    }

    fn backup_to(&self, target: &Path, backup_path: &Path) -> Result<()> {
        atomic_copy(target, backup_path)
    }

    fn after_save(&self, _target: &Path) -> Result<()> {
        Ok(())
    }

    fn can_restore(&self, target: &Path) -> bool {
        self.backups_for(target)
            .map(|backups| !backups.is_empty())
            .unwrap_or(false)
    }

    fn try_restore(&self, target: &Path) -> Result<bool> {
        let Some(latest) = self.backups_for(target)?.into_iter().next() else {
            return Ok(false);
        };

        atomic_copy(&latest.path, target)?;
        info!(
            path = %target.display(),
            backup = %latest.path.display(),
            "Restored file from backup"
        );
        Ok(true)
    }

    fn can_rename(&self, target: &Path, new_path: &Path) -> bool {
        self.rename_pairs(target, new_path)
            .iter()
            .all(|pair| !pair.renamed().exists())
    }

    fn rename(&self, target: &Path, new_path: &Path, overwrite: bool) -> Result<()> {
        let pairs = self.rename_pairs(target, new_path);
        if pairs.is_empty() {
            return Ok(());
        }
        RenameTransaction::new(pairs).commit(overwrite)
    }

    fn rename_pairs(&self, target: &Path, new_path: &Path) -> Vec<RenamePair<PathBuf>> {
        let (Ok(backups), Ok(new_name)) = (self.backups_for(target), Self::file_name(new_path))
        else {
            return Vec::new();
        };
        let new_dir = self.backup_dir(new_path);

        backups
            .into_iter()
            .map(|backup| {
                let renamed = new_dir.join(self.backup_name(&new_name, &backup.stamp));
                RenamePair::new(backup.path, renamed)
            })
            .collect()
    }

    fn delete_backups(&self, target: &Path) -> Result<()> {
        for backup in self.backups_for(target)? {
            fs::remove_file(&backup.path)
                .map_err(|source| PersistenceError::io(FileOp::Delete, &backup.path, source))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepfile_persistence::{SaveOptions, SaveTransaction};
    use tempfile::tempdir;

    fn save(target: &Path, bytes: &[u8], backuper: &FileBackuper) {
        SaveTransaction::new(target, &SaveOptions::default(), backuper)
            .unwrap()
            .commit_bytes(bytes)
            .unwrap();
    }

    fn backup_contents(backuper: &FileBackuper, target: &Path) -> Vec<Vec<u8>> {
        backuper
            .backups_for(target)
            .unwrap()
            .iter()
            .map(|b| fs::read(&b.path).unwrap())
            .collect()
    }

    #[test]
    fn test_huge_max_age_disables_age_cutoff() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::new(BackupSettings::new().with_max_age_in_days(u32::MAX));

        save(&target, b"A", &backuper);
        save(&target, b"B", &backuper);
        save(&target, b"C", &backuper);

        assert_eq!(backup_contents(&backuper, &target), vec![b"B".to_vec(), b"A".to_vec()]);
    }

    #[test]
    fn test_time_only_stamps_fall_back_to_mtime() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::new(
            BackupSettings::new()
                .with_timestamp_format("%H-%M-%S%.6f")
                .with_number_of_backups(1),
        );

        for bytes in [b"1", b"2", b"3", b"4"] {
            save(&target, bytes, &backuper);
        }

        let on_disk = fs::read_dir(backuper.backup_dir(&target)).unwrap().count();
        assert_eq!(on_disk, 1);
        assert_eq!(backup_contents(&backuper, &target), vec![b"3".to_vec()]);
        assert!(backuper.can_restore(&target));
        assert!(backuper.try_restore(&target).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"3");
    }

    #[test]
    fn test_first_save_takes_no_backup() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::default();

        save(&target, b"A", &backuper);

        assert!(backuper.backups_for(&target).unwrap().is_empty());
        assert!(!backuper.can_restore(&target));
    }

    #[test]
    fn test_overwrite_backs_up_and_restores_previous_bytes() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::default();

        save(&target, b"A", &backuper);
        save(&target, b"B", &backuper);

        let backups = backuper.backups_for(&target).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].path.parent().unwrap(), dir.path().join("backup"));
        assert_eq!(fs::read(&backups[0].path).unwrap(), b"A");

        assert!(backuper.try_restore(&target).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"A");
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::new(
            BackupSettings::new()
                .with_directory(dir.path().join("bk"))
                .with_number_of_backups(2),
        );

        for content in [b"1", b"2", b"3", b"4"] {
            save(&target, content, &backuper);
        }

        assert_eq!(
            backup_contents(&backuper, &target),
            vec![b"3".to_vec(), b"2".to_vec()]
        );
    }

    #[test]
    fn test_max_age_prunes_old_backups() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::new(BackupSettings::new().with_max_age_in_days(30));
        let backup_dir = backuper.backup_dir(&target);
        fs::create_dir_all(&backup_dir).unwrap();
        let ancient = backup_dir.join("dummy.cfg.2001-01-01_00-00-00.000.bak");
        fs::write(&ancient, b"ancient").unwrap();

        save(&target, b"A", &backuper);
        save(&target, b"B", &backuper);

        assert!(!ancient.exists());
        assert_eq!(backup_contents(&backuper, &target), vec![b"A".to_vec()]);
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::default();
        let backup_dir = backuper.backup_dir(&target);
        fs::create_dir_all(&backup_dir).unwrap();
        fs::write(backup_dir.join("dummy.cfg.old.cfg.2020-01-01_00-00-00.000.tmp"), b"x").unwrap();
        fs::write(backup_dir.join("other.cfg.2020-01-01_00-00-00.000.bak"), b"x").unwrap();
        fs::write(backup_dir.join("dummy.cfg.not-a-date.bak"), b"x").unwrap();

        assert!(backuper.backups_for(&target).unwrap().is_empty());
    }

    #[test]
    fn test_try_restore_without_backup() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        fs::write(&target, b"current").unwrap();

        assert!(!FileBackuper::default().try_restore(&target).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"current");
    }

    #[test]
    fn test_rename_moves_backups_with_stamps() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let renamed = dir.path().join("renamed.cfg");
        let backuper = FileBackuper::default();
        save(&target, b"A", &backuper);
        save(&target, b"B", &backuper);
        let stamp = backuper.backups_for(&target).unwrap()[0].stamp.clone();

        assert!(backuper.can_rename(&target, &renamed));
        backuper.rename(&target, &renamed, false).unwrap();

        assert!(backuper.backups_for(&target).unwrap().is_empty());
        let moved = backuper.backups_for(&renamed).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].stamp, stamp);
        assert_eq!(fs::read(&moved[0].path).unwrap(), b"A");
    }

    #[test]
    fn test_delete_backups() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let backuper = FileBackuper::default();
        save(&target, b"A", &backuper);
        save(&target, b"B", &backuper);

        backuper.delete_backups(&target).unwrap();

        assert!(backuper.backups_for(&target).unwrap().is_empty());
        assert_eq!(fs::read(&target).unwrap(), b"B");
    }

    #[test]
    fn test_same_instant_backups_get_distinct_names() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        // Second resolution makes collisions certain.
        let backuper = FileBackuper::new(
            BackupSettings::new()
                .with_timestamp_format("%Y-%m-%d_%H-%M-%S")
                .with_number_of_backups(0),
        );
        fs::write(&target, b"A").unwrap();

        let mut lock = LockedFile::open(&target, keepfile_persistence::Access::Hold).unwrap();
        backuper.backup(&mut lock).unwrap();
        backuper.backup(&mut lock).unwrap();

        let backups = backuper.backups_for(&target).unwrap();
        assert_eq!(backups.len(), 2);
        assert_ne!(backups[0].path, backups[1].path);
    }
}
