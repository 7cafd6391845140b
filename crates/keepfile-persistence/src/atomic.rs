//! Unlocked atomic file helpers.
//!
//! These are for files that no transaction guards, such as backup copies:
//! write to an anonymous temp file in the same directory, then rename.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{FileOp, PersistenceError, Result};

/// Writes data to a file atomically.
///
/// The data goes to a temporary file next to `path` first, which is then
/// renamed over `path`. Readers see either the old or the new content.
///
/// # Errors
/// Returns an error if the directory, the write, the sync or the rename fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| PersistenceError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    // Same directory, so the rename never crosses filesystems
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)
        .map_err(|source| PersistenceError::io(FileOp::Open, dir, source))?;

    temp_file
        .write_all(data)
        .map_err(|source| PersistenceError::io(FileOp::Write, path, source))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|source| PersistenceError::io(FileOp::Sync, path, source))?;

    temp_file
        .persist(path)
        .map_err(|e| PersistenceError::io(FileOp::Move, path, e.error))?;

    Ok(())
}

/// Atomically replaces `to` with a copy of `from`.
pub fn atomic_copy(from: &Path, to: &Path) -> Result<()> {
    let data = read_file(from)?;
    atomic_write(to, &data)
}

/// Reads a whole file.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| PersistenceError::io(FileOp::Read, path, source))
}

/// Reads a whole file, returning `None` if it doesn't exist.
pub fn read_file_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PersistenceError::io(FileOp::Read, path, source)),
    }
}
