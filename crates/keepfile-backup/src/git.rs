//! Commit-per-save backups in a git repository.
//!
//! The directory holding the target becomes (or already is) a git work
//! tree. Every published save is committed, a failed save is undone by
//! checking the file out of `HEAD`.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use keepfile_persistence::atomic::atomic_copy;
use keepfile_persistence::{Backuper, LockedFile, PersistenceError, RenamePair, Result};
use tracing::{debug, info, warn};

const COMMIT_IDENTITY: [&str; 6] = [
    "-c",
    "user.name=keepfile",
    "-c",
    "user.email=keepfile@localhost",
    "-c",
    "commit.gpgsign=false",
];

/// Backs files up by committing them to git.
#[derive(Debug, Clone, Default)]
pub struct GitBackuper;

impl GitBackuper {
    pub fn new() -> Self {
        Self
    }

    fn parent(target: &Path) -> PathBuf {
        match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn git(dir: &Path, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| PersistenceError::Backup(format!("failed to run git {}: {}", args.join(" "), e)))
    }

    fn git_checked(dir: &Path, args: &[&str]) -> Result<Output> {
        let output = Self::git(dir, args)?;
        if output.status.success() {
            return Ok(output);
        }
        Err(PersistenceError::Backup(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    /// Check if `dir` is inside a git worktree.
    pub fn is_git_worktree(dir: &Path) -> bool {
        Self::git(dir, &["rev-parse", "--is-inside-work-tree"])
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
            .unwrap_or(false)
    }

    fn has_changes(dir: &Path, paths: &[&str]) -> Result<bool> {
        let mut args = vec!["status", "--porcelain", "--"];
        args.extend_from_slice(paths);
        let status = Self::git_checked(dir, &args)?;
        Ok(!String::from_utf8_lossy(&status.stdout).trim().is_empty())
    }

    /// Stages `paths` (additions and deletions) and commits them.
    ///
    /// Returns `Ok(false)` when there was nothing to commit.
    fn commit_paths(dir: &Path, paths: &[&str], message: &str) -> Result<bool> {
        let mut add = vec!["add", "-A", "--"];
        add.extend_from_slice(paths);
        Self::git_checked(dir, &add)?;

        if !Self::has_changes(dir, paths)? {
            debug!(dir = %dir.display(), "Nothing to commit");
            return Ok(false);
        }

        let mut commit: Vec<&str> = COMMIT_IDENTITY.to_vec();
        commit.extend_from_slice(&["commit", "-m", message, "--"]);
        commit.extend_from_slice(paths);
        Self::git_checked(dir, &commit)?;
        Ok(true)
    }

    fn name_of(target: &Path) -> Result<String> {
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PersistenceError::InvalidOperation(format!("{} has no file name", target.display()))
            })
    }
}

impl Backuper for GitBackuper {
    fn before_save(&self, target: &Path) -> Result<bool> {
        let dir = Self::parent(target);
        if Self::is_git_worktree(&dir) {
            return Ok(false);
        }
        Self::git_checked(&dir, &["init", "--quiet"])?;
        info!(dir = %dir.display(), "Initialised git repository for backups");
        Ok(true)
    }

    fn backup(&self, _target: &mut LockedFile) -> Result<()> {
        // The previous content is already in HEAD; the new one is committed
        // by after_save.
        Ok(())
    }

    fn backup_to(&self, target: &Path, backup_path: &Path) -> Result<()> {
        atomic_copy(target, backup_path)
    }

    fn after_save(&self, target: &Path) -> Result<()> {
        let dir = Self::parent(target);
        let name = Self::name_of(target)?;
        let committed = Self::commit_paths(&dir, &[&name], &format!("Save {name}"))?;
        if committed {
            debug!(path = %target.display(), "Committed save");
        }
        Ok(())
    }

    fn can_restore(&self, target: &Path) -> bool {
        let dir = Self::parent(target);
        let Ok(name) = Self::name_of(target) else {
            return false;
        };
        Self::git(&dir, &["cat-file", "-e", &format!("HEAD:./{name}")])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn try_restore(&self, target: &Path) -> Result<bool> {
        if !self.can_restore(target) {
            return Ok(false);
        }
        let dir = Self::parent(target);
        let name = Self::name_of(target)?;
        Self::git_checked(&dir, &["checkout", "HEAD", "--", &name])?;
        info!(path = %target.display(), "Restored file from HEAD");
        Ok(true)
    }

    fn can_rename(&self, _target: &Path, _new_path: &Path) -> bool {
        true
    }

    /// Records a rename that already happened on disk.
    fn rename(&self, target: &Path, new_path: &Path, _overwrite: bool) -> Result<()> {
        let dir = Self::parent(target);
        let old = target.to_string_lossy().into_owned();
        let new = new_path.to_string_lossy().into_owned();
        let message = format!("Rename {} to {}", Self::name_of(target)?, Self::name_of(new_path)?);
        Self::commit_paths(&dir, &[&old, &new], &message)?;
        Ok(())
    }

    fn rename_pairs(&self, _target: &Path, _new_path: &Path) -> Vec<RenamePair<PathBuf>> {
        Vec::new()
    }

    fn delete_backups(&self, target: &Path) -> Result<()> {
        warn!(
            path = %target.display(),
            "Git history is kept; deleting backups would require rewriting it"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepfile_persistence::{SaveOptions, SaveTransaction};
    use std::fs;
    use tempfile::tempdir;

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    fn save(target: &Path, bytes: &[u8]) -> Result<()> {
        SaveTransaction::new(target, &SaveOptions::default(), &GitBackuper)?.commit_bytes(bytes)
    }

    fn commit_count(dir: &Path) -> usize {
        let output = GitBackuper::git_checked(dir, &["rev-list", "--count", "HEAD"]).unwrap();
        String::from_utf8_lossy(&output.stdout).trim().parse().unwrap()
    }

    fn has_stray_artifacts(dir: &Path) -> bool {
        let output = GitBackuper::git_checked(dir, &["status", "--porcelain"]).unwrap();
        let status = String::from_utf8_lossy(&output.stdout);
        status.contains(".tmp") || status.contains(".deleting")
    }

    #[test]
    fn test_saves_are_committed() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");

        save(&target, b"A").unwrap();
        save(&target, b"B").unwrap();
        save(&target, b"B").unwrap();

        assert!(GitBackuper::is_git_worktree(dir.path()));
        assert_eq!(commit_count(dir.path()), 2);
        assert!(!has_stray_artifacts(dir.path()));
    }

    #[test]
    fn test_restore_checks_out_head() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        save(&target, b"committed").unwrap();
        fs::write(&target, b"scribbled").unwrap();

        assert!(GitBackuper.can_restore(&target));
        assert!(GitBackuper.try_restore(&target).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"committed");
    }

    #[test]
    fn test_nothing_to_restore_in_fresh_repo() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let target = dir.path().join("never.cfg");

        assert!(!GitBackuper.can_restore(&target));
        assert!(!GitBackuper.try_restore(&target).unwrap());
    }

    #[test]
    fn test_rename_is_committed() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let target = dir.path().join("dummy.cfg");
        let renamed = dir.path().join("renamed.cfg");
        save(&target, b"A").unwrap();

        fs::rename(&target, &renamed).unwrap();
        GitBackuper.rename(&target, &renamed, false).unwrap();

        assert_eq!(commit_count(dir.path()), 2);
        assert!(GitBackuper.can_restore(&renamed));
        assert!(!GitBackuper.can_restore(&target));
    }
}
