//! Typed repository of objects persisted one file each.
//!
//! Ties the pieces of `keepfile-persistence` together: crash-safe saves,
//! dirty tracking, optional backups and a weak cache that hands out one
//! shared instance per file.
//!
//! # Example
//!
//! ```no_run
//! use keepfile_formats::JsonSerializer;
//! use keepfile_repository::{Repository, RepositorySettings, SaveOutcome};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Prefs {
//!     theme: String,
//! }
//!
//! let settings = RepositorySettings::for_app("my-app");
//! let repo: Repository<Prefs, _> = Repository::new(settings, JsonSerializer::default());
//!
//! let prefs = repo.read_or_default("prefs")?;
//! prefs.write().unwrap().theme = "dark".to_string();
//! assert_eq!(repo.save_shared("prefs", &prefs)?, SaveOutcome::Saved);
//! # Ok::<(), keepfile_persistence::PersistenceError>(())
//! ```

pub mod cache;
pub mod repository;
pub mod settings;

pub use cache::InstanceCache;
pub use repository::{Repository, SaveOutcome};
pub use settings::{
    default_directory, ensure_directories, RepositorySettings, DEFAULT_APP_NAME,
    DEFAULT_EXTENSION, DIRECTORY_ENV,
};
