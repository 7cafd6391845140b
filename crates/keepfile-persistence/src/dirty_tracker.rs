//! Dirty tracking against the last persisted state.
//!
//! The tracker keeps a structural clone of every item as it was last saved
//! or loaded, keyed by the file it lives in. Asking whether an item is dirty
//! compares the live value against that clone and never touches disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace};

use crate::error::{PersistenceError, Result};
use crate::serializer::Serializer;

/// Canonical cache key for a file: absolute path, lower-cased.
pub fn canonical_key(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    absolute.to_string_lossy().to_lowercase()
}

/// Thread-safe store of last-known-saved clones.
///
/// # Concurrency
///
/// Plain reads go through the `RwLock` only. Mutations additionally take a
/// coarse `gate` so that compound check-then-act sequences such as
/// [`DirtyTracker::rename`] are never interleaved with a concurrent
/// [`DirtyTracker::track`].
pub struct DirtyTracker<T> {
    serializer: Arc<dyn Serializer<T>>,
    entries: RwLock<HashMap<String, T>>,
    gate: Mutex<()>,
}

impl<T> DirtyTracker<T> {
    /// Creates an empty tracker that clones through `serializer`.
    pub fn new(serializer: Arc<dyn Serializer<T>>) -> Self {
        Self {
            serializer,
            entries: RwLock::new(HashMap::new()),
            gate: Mutex::new(()),
        }
    }

    /// Records `item` as the persisted baseline for `key`, replacing any
    /// previous entry.
    pub fn track(&self, key: &Path, item: &T) -> Result<()> {
        let clone = self.serializer.clone_item(item)?;
        let key = canonical_key(key);

        let _gate = self.lock_gate()?;
        self.write_entries()?.insert(key.clone(), clone);
        trace!(key = %key, "Tracking baseline");
        Ok(())
    }

    /// True if there is no baseline for `key` or `equals(baseline, item)` is
    /// false.
    pub fn is_dirty<F>(&self, item: &T, key: &Path, equals: F) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        let key = canonical_key(key);
        match self.entries.read() {
            Ok(entries) => entries
                .get(&key)
                .map_or(true, |baseline| !equals(baseline, item)),
            Err(_) => true,
        }
    }

    /// [`DirtyTracker::is_dirty`] using the serializer's structural equality.
    pub fn is_dirty_with_serializer(&self, item: &T, key: &Path) -> bool {
        let serializer = Arc::clone(&self.serializer);
        self.is_dirty(item, key, |a, b| serializer.structural_equals(a, b))
    }

    /// Whether a baseline exists for `key`.
    pub fn contains(&self, key: &Path) -> bool {
        let key = canonical_key(key);
        self.entries
            .read()
            .map(|entries| entries.contains_key(&key))
            .unwrap_or(false)
    }

    /// Forgets the baseline for `key`.
    pub fn remove(&self, key: &Path) -> Result<()> {
        let key = canonical_key(key);
        let _gate = self.lock_gate()?;
        if self.write_entries()?.remove(&key).is_some() {
            debug!(key = %key, "Stopped tracking");
        }
        Ok(())
    }

    /// Forgets every baseline.
    pub fn clear(&self) -> Result<()> {
        let _gate = self.lock_gate()?;
        self.write_entries()?.clear();
        Ok(())
    }

    /// Moves the baseline of `old_key` to `new_key`.
    ///
    /// A missing `old_key` is a no-op.
    ///
    /// # Errors
    /// `InvalidOperation` if `new_key` already has a baseline and
    /// `overwrite` is false.
    pub fn rename(&self, old_key: &Path, new_key: &Path, overwrite: bool) -> Result<()> {
        let old = canonical_key(old_key);
        let new = canonical_key(new_key);
        if old == new {
            return Ok(());
        }

        let _gate = self.lock_gate()?;
        let mut entries = self.write_entries()?;
        if entries.contains_key(&new) && !overwrite {
            return Err(PersistenceError::InvalidOperation(format!(
                "{} is already tracked",
                new_key.display()
            )));
        }
        if let Some(baseline) = entries.remove(&old) {
            entries.insert(new.clone(), baseline);
            debug!(from = %old, to = %new, "Moved tracked baseline");
        }
        Ok(())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the tracked keys.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_gate(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.gate
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))
    }

    fn write_entries(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, T>>> {
        self.entries
            .write()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))
    }
}
