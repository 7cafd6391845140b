//! Error types for persistence operations.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The filesystem step that failed inside an [`PersistenceError::Io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Open,
    Read,
    Write,
    Sync,
    Delete,
    Move,
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileOp::Open => "open",
            FileOp::Read => "read",
            FileOp::Write => "write",
            FileOp::Sync => "sync",
            FileOp::Delete => "delete",
            FileOp::Move => "move",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during persistence operations.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// A filesystem operation failed.
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: FileOp,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is locked by another handle.
    #[error("{path} is locked by another writer: {source}")]
    Locked {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create directory.
    #[error("failed to create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Lock acquisition did not succeed before the deadline.
    #[error("timed out after {timeout:?} waiting for lock on {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    /// The serializer rejected the data.
    #[error("serialization failed: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A caller precondition was violated.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A save failed and restoring the previous content failed as well.
    ///
    /// The state of `path` is unknown after this error.
    #[error("restore of {path} failed after a failed save: {original}; restore error: {restore}")]
    RestoreFailed {
        path: PathBuf,
        original: Box<PersistenceError>,
        restore: Box<PersistenceError>,
    },

    /// A backup strategy failed for a reason other than plain I/O.
    #[error("backup failed: {0}")]
    Backup(String),

    /// Item not found.
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Lock poisoned (thread panicked while holding lock).
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl PersistenceError {
    /// Wraps an OS error raised by `op` on `path`.
    pub fn io(op: FileOp, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Wraps a codec error.
    pub fn serialization<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PersistenceError::Serialization {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Builds a serialization error from a plain message.
    pub fn serialization_msg(message: impl Into<String>) -> Self {
        PersistenceError::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// True for errors raised by the operating system while touching files,
    /// including lock contention.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            PersistenceError::Io { .. }
                | PersistenceError::Locked { .. }
                | PersistenceError::Directory { .. }
        )
    }

    /// True when the target's state is unknown and needs manual inspection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PersistenceError::RestoreFailed { .. })
    }
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_failed_mentions_both_causes() {
        let err = PersistenceError::RestoreFailed {
            path: PathBuf::from("/data/settings.json"),
            original: Box::new(PersistenceError::serialization_msg("bad payload")),
            restore: Box::new(PersistenceError::Backup("backup unreadable".to_string())),
        };

        let text = err.to_string();
        assert!(text.contains("bad payload"));
        assert!(text.contains("backup unreadable"));
        assert!(err.is_fatal());
        assert!(!err.is_io());
    }

    #[test]
    fn test_locked_counts_as_io() {
        let err = PersistenceError::Locked {
            path: PathBuf::from("a.json"),
            source: std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy"),
        };
        assert!(err.is_io());
    }
}
