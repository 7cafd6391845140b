//! All-or-nothing rename of a batch of files.
//!
//! Every pair is validated and both of its paths locked before the first
//! file moves. Only once the whole batch is reserved do the moves run.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{FileOp, PersistenceError, Result};
use crate::locked_file::{Access, LockedFile};

/// An immutable `(current, renamed)` pair.
///
/// `RenamePair<PathBuf>` is a request; `RenamePair<LockedFile>` is the
/// reserved, in-flight form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePair<T> {
    current: T,
    renamed: T,
}

impl<T> RenamePair<T> {
    pub fn new(current: T, renamed: T) -> Self {
        Self { current, renamed }
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    pub fn renamed(&self) -> &T {
        &self.renamed
    }

    pub fn into_parts(self) -> (T, T) {
        (self.current, self.renamed)
    }
}

impl RenamePair<PathBuf> {
    /// Shorthand for a path request.
    pub fn paths(current: impl Into<PathBuf>, renamed: impl Into<PathBuf>) -> Self {
        Self::new(current.into(), renamed.into())
    }
}

/// Lower-cased textual form used to compare paths case-insensitively.
pub(crate) fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// Reserved destination plus what the validation pass created for it.
#[derive(Debug)]
struct Reserved {
    pair: RenamePair<LockedFile>,
    created_destination: bool,
    /// Directories created for the destination, deepest first.
    created_dirs: Vec<PathBuf>,
}

impl Reserved {
    fn publish(self) -> Result<()> {
        let (mut current, mut renamed) = self.pair.into_parts();
        let from = current.path().to_path_buf();
        let to = renamed.path().to_path_buf();

        // The move replaces the reserved destination in one step. Unix lets
        // both locks stay held across it.
        if cfg!(not(unix)) {
            current.close();
            renamed.close();
        }
        if let Err(source) = fs::rename(&from, &to) {
            if self.created_destination {
                renamed.dispose_and_delete();
            }
            remove_created_dirs(&self.created_dirs);
            return Err(PersistenceError::io(FileOp::Move, &from, source));
        }
        current.close();
        renamed.close();
        info!(from = %from.display(), to = %to.display(), "Renamed file");
        Ok(())
    }

    fn release(self) {
        let (current, renamed) = self.pair.into_parts();
        drop(current);
        if self.created_destination {
            renamed.dispose_and_delete();
        } else {
            drop(renamed);
        }
        remove_created_dirs(&self.created_dirs);
    }
}

/// Renames a batch of files so that either every pair passes validation
/// before anything moves, or nothing moves at all.
#[derive(Debug)]
pub struct RenameTransaction {
    requested: Vec<RenamePair<PathBuf>>,
    reserved: Vec<Reserved>,
}

impl RenameTransaction {
    /// Creates a transaction over `pairs`.
    ///
    /// Pairs are deduplicated by current path, ignoring case; the first
    /// occurrence wins.
    pub fn new(pairs: impl IntoIterator<Item = RenamePair<PathBuf>>) -> Self {
        let mut seen = HashSet::new();
        let requested = pairs
            .into_iter()
            .filter(|pair| seen.insert(path_key(pair.current())))
            .collect();
        Self {
            requested,
            reserved: Vec::new(),
        }
    }

    /// The deduplicated requests.
    pub fn pairs(&self) -> &[RenamePair<PathBuf>] {
        &self.requested
    }

    /// Validates and reserves every pair, then moves them.
    ///
    /// # Errors
    /// * `InvalidOperation` if `overwrite` is false and a destination
    ///   exists. Nothing has moved in that case.
    /// * Lock or I/O errors while reserving, again before anything moved.
    /// * I/O errors from the move pass.
    pub fn commit(mut self, overwrite: bool) -> Result<()> {
        let requested = std::mem::take(&mut self.requested);
        for pair in &requested {
            self.reserve(pair, overwrite)?;
        }

        debug!(count = self.reserved.len(), "Rename batch validated");

        let mut pending = std::mem::take(&mut self.reserved).into_iter();
        while let Some(reserved) = pending.next() {
            if let Err(e) = reserved.publish() {
                pending.rev().for_each(Reserved::release);
                return Err(e);
            }
        }

        Ok(())
    }

    fn reserve(&mut self, pair: &RenamePair<PathBuf>, overwrite: bool) -> Result<()> {
        let current = LockedFile::open(pair.current(), Access::Observe)?;

        let destination = pair.renamed();
        let existed = destination.exists();
        if existed && !overwrite {
            drop(current);
            return Err(PersistenceError::InvalidOperation(format!(
                "cannot rename {} to {}: destination already exists",
                pair.current().display(),
                destination.display()
            )));
        }

        let created_dirs = create_missing_parents(destination)?;
        let renamed = match LockedFile::open(destination, Access::Hold) {
            Ok(renamed) => renamed,
            Err(e) => {
                remove_created_dirs(&created_dirs);
                return Err(e);
            }
        };
        self.reserved.push(Reserved {
            pair: RenamePair::new(current, renamed),
            created_destination: !existed,
            created_dirs,
        });
        Ok(())
    }
}

impl Drop for RenameTransaction {
    fn drop(&mut self) {
        // Newest first, so shared parent directories are empty by the time
        // the pair that created them is released.
        self.reserved.drain(..).rev().for_each(Reserved::release);
    }
}

/// Creates the missing parent directories of `path`, returning the ones
/// that did not exist, deepest first.
fn create_missing_parents(path: &Path) -> Result<Vec<PathBuf>> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(Vec::new());
    };
    let missing: Vec<PathBuf> = parent
        .ancestors()
        .take_while(|dir| !dir.as_os_str().is_empty() && !dir.exists())
        .map(Path::to_path_buf)
        .collect();
    if missing.is_empty() {
        return Ok(missing);
    }

    fs::create_dir_all(parent).map_err(|source| PersistenceError::Directory {
        path: parent.to_path_buf(),
        source,
    })?;
    Ok(missing)
}

/// Removes directories an aborted reservation created. Stops at the first
/// one that is not empty.
fn remove_created_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        if let Err(e) = fs::remove_dir(dir) {
            debug!(path = %dir.display(), error = %e, "Keeping directory");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rename_moves_all_pairs() {
        let dir = tempdir().unwrap();
        let f1 = dir.path().join("f1.json");
        let f2 = dir.path().join("f2.json");
        fs::write(&f1, b"one").unwrap();
        fs::write(&f2, b"two").unwrap();
        let g1 = dir.path().join("g1.json");
        let g2 = dir.path().join("nested/g2.json");

        RenameTransaction::new([RenamePair::paths(&f1, &g1), RenamePair::paths(&f2, &g2)])
            .commit(false)
            .unwrap();

        assert!(!f1.exists());
        assert!(!f2.exists());
        assert_eq!(fs::read(&g1).unwrap(), b"one");
        assert_eq!(fs::read(&g2).unwrap(), b"two");
    }

    #[test]
    fn test_existing_destination_aborts_whole_batch() {
        let dir = tempdir().unwrap();
        let f1 = dir.path().join("f1.json");
        let f2 = dir.path().join("f2.json");
        let g1 = dir.path().join("g1.json");
        let g2 = dir.path().join("g2.json");
        fs::write(&f1, b"one").unwrap();
        fs::write(&f2, b"two").unwrap();
        fs::write(&g1, b"occupied").unwrap();

        // The valid pair comes first so it is already reserved when the
        // second one fails.
        let result =
            RenameTransaction::new([RenamePair::paths(&f2, &g2), RenamePair::paths(&f1, &g1)])
                .commit(false);

        assert!(matches!(result, Err(PersistenceError::InvalidOperation(_))));
        assert_eq!(fs::read(&f1).unwrap(), b"one");
        assert_eq!(fs::read(&f2).unwrap(), b"two");
        assert_eq!(fs::read(&g1).unwrap(), b"occupied");
        assert!(!g2.exists());
    }

    #[test]
    fn test_aborted_batch_removes_created_directories() {
        let dir = tempdir().unwrap();
        let f1 = dir.path().join("f1.json");
        let f2 = dir.path().join("f2.json");
        let g1 = dir.path().join("g1.json");
        fs::write(&f1, b"one").unwrap();
        fs::write(&f2, b"two").unwrap();
        fs::write(&g1, b"taken").unwrap();
        let g2 = dir.path().join("fresh/deep/g2.json");
        let g3 = dir.path().join("fresh/deep/g3.json");
        let f3 = dir.path().join("f3.json");
        fs::write(&f3, b"three").unwrap();

        let result = RenameTransaction::new([
            RenamePair::paths(&f2, &g2),
            RenamePair::paths(&f3, &g3),
            RenamePair::paths(&f1, &g1),
        ])
        .commit(false);

        assert!(matches!(result, Err(PersistenceError::InvalidOperation(_))));
        assert!(!dir.path().join("fresh").exists());
        assert_eq!(fs::read(&f2).unwrap(), b"two");
        assert_eq!(fs::read(&f3).unwrap(), b"three");
        assert_eq!(fs::read(&g1).unwrap(), b"taken");
    }

    #[test]
    fn test_overwrite_replaces_destination() {
        let dir = tempdir().unwrap();
        let f1 = dir.path().join("f1.json");
        let g1 = dir.path().join("g1.json");
        fs::write(&f1, b"fresh").unwrap();
        fs::write(&g1, b"old").unwrap();

        RenameTransaction::new([RenamePair::paths(&f1, &g1)])
            .commit(true)
            .unwrap();

        assert!(!f1.exists());
        assert_eq!(fs::read(&g1).unwrap(), b"fresh");
    }

    #[test]
    fn test_duplicates_are_dropped_case_insensitively() {
        let dir = tempdir().unwrap();
        let f1 = dir.path().join("settings.json");
        let upper = dir.path().join("SETTINGS.json");

        let tx = RenameTransaction::new([
            RenamePair::paths(&f1, dir.path().join("a.json")),
            RenamePair::paths(&upper, dir.path().join("b.json")),
        ]);

        assert_eq!(tx.pairs().len(), 1);
        assert_eq!(tx.pairs()[0].renamed(), &dir.path().join("a.json"));
    }

    #[test]
    fn test_missing_source_fails_before_mutation() {
        let dir = tempdir().unwrap();
        let f1 = dir.path().join("f1.json");
        fs::write(&f1, b"one").unwrap();
        let g1 = dir.path().join("g1.json");

        let result = RenameTransaction::new([
            RenamePair::paths(&f1, &g1),
            RenamePair::paths(dir.path().join("missing.json"), dir.path().join("g2.json")),
        ])
        .commit(false);

        assert!(result.unwrap_err().is_io());
        assert!(f1.exists());
        assert!(!g1.exists());
    }

    #[test]
    fn test_locked_source_aborts() {
        let dir = tempdir().unwrap();
        let f1 = dir.path().join("f1.json");
        fs::write(&f1, b"one").unwrap();
        let _holder = LockedFile::open(&f1, Access::Hold).unwrap();

        let result =
            RenameTransaction::new([RenamePair::paths(&f1, dir.path().join("g1.json"))])
                .commit(false);

        assert!(matches!(result, Err(PersistenceError::Locked { .. })));
        assert!(f1.exists());
    }
}
