//! Crash-safe persistence of single files.
//!
//! A save never writes into the file it replaces. New bytes go to a temp
//! sibling, the previous content can be handed to a [`Backuper`], and only
//! then is the temp renamed over the target. Concurrent saves collide on OS
//! file locks held by [`LockedFile`] handles, so contention between
//! processes is caught as well as contention between threads.
//!
//! # Example
//!
//! ```no_run
//! use keepfile_persistence::{NullBackuper, SaveOptions, SaveTransaction};
//!
//! let options = SaveOptions::default();
//! SaveTransaction::new("/home/user/.app/settings.json", &options, &NullBackuper)?
//!     .commit_bytes(br#"{"value":1}"#)?;
//! # Ok::<(), keepfile_persistence::PersistenceError>(())
//! ```

pub mod atomic;
pub mod backuper;
pub mod dirty_tracker;
pub mod error;
pub mod locked_file;
pub mod rename_transaction;
pub mod save_transaction;
pub mod serializer;

pub use backuper::{Backuper, NullBackuper};
pub use dirty_tracker::{canonical_key, DirtyTracker};
pub use error::{FileOp, PersistenceError, Result};
pub use locked_file::{Access, LockedFile, LOCK_RETRY_INTERVAL};
pub use rename_transaction::{RenamePair, RenameTransaction};
pub use save_transaction::{
    recover_stale_artifacts, sentinel_path, temp_path, RecoveryReport, SaveOptions,
    SaveTransaction, DEFAULT_LOCK_TIMEOUT, DEFAULT_TEMP_EXTENSION, SOFT_DELETE_EXTENSION,
};
pub use serializer::Serializer;
