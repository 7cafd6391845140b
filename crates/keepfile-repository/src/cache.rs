//! Weak singleton cache of live instances.
//!
//! At most one live `Arc<RwLock<T>>` exists per file. The cache only holds
//! weak references, so an instance disappears once every caller has dropped
//! it and the next read loads it from disk again.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard, Weak};

use keepfile_persistence::{canonical_key, PersistenceError, Result};
use tracing::trace;

type Entries<T> = HashMap<String, Weak<RwLock<T>>>;

/// Per-path cache of shared instances.
///
/// # Concurrency
///
/// Lookups only take the map's read lock. Get-or-insert holds the coarse
/// `gate` across the load so two threads reading the same file end up with
/// the same instance.
pub struct InstanceCache<T> {
    entries: RwLock<Entries<T>>,
    gate: Mutex<()>,
}

impl<T> Default for InstanceCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InstanceCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            gate: Mutex::new(()),
        }
    }

    /// The live instance for `path`, if any caller still holds one.
    pub fn get(&self, path: &Path) -> Option<Arc<RwLock<T>>> {
        let key = canonical_key(path);
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&key).and_then(Weak::upgrade))
    }

    /// Returns the live instance for `path`, loading it with `load` if there
    /// is none. The flag is true when `load` ran.
    pub fn get_or_try_insert_with<F>(&self, path: &Path, load: F) -> Result<(Arc<RwLock<T>>, bool)>
    where
        F: FnOnce() -> Result<T>,
    {
        let _gate = self.lock_gate()?;
        if let Some(instance) = self.get(path) {
            return Ok((instance, false));
        }

        let instance = Arc::new(RwLock::new(load()?));
        let mut entries = self.write_entries()?;
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.insert(canonical_key(path), Arc::downgrade(&instance));
        trace!(path = %path.display(), "Cached instance");
        Ok((instance, true))
    }

    /// Registers `instance` as the live one for `path`.
    pub fn insert(&self, path: &Path, instance: &Arc<RwLock<T>>) -> Result<()> {
        let _gate = self.lock_gate()?;
        self.write_entries()?
            .insert(canonical_key(path), Arc::downgrade(instance));
        Ok(())
    }

    /// Evicts `path`, returning the instance if it was still alive.
    pub fn remove(&self, path: &Path) -> Result<Option<Arc<RwLock<T>>>> {
        let _gate = self.lock_gate()?;
        Ok(self
            .write_entries()?
            .remove(&canonical_key(path))
            .and_then(|weak| weak.upgrade()))
    }

    /// Moves the entry of `old` to `new`, replacing whatever `new` held.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let _gate = self.lock_gate()?;
        let mut entries = self.write_entries()?;
        let new_key = canonical_key(new);
        entries.remove(&new_key);
        if let Some(weak) = entries.remove(&canonical_key(old)) {
            entries.insert(new_key, weak);
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let _gate = self.lock_gate()?;
        self.write_entries()?.clear();
        Ok(())
    }

    /// Whether a live instance exists for `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|entries| entries.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_gate(&self) -> Result<MutexGuard<'_, ()>> {
        self.gate
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))
    }

    fn write_entries(&self) -> Result<RwLockWriteGuard<'_, Entries<T>>> {
        self.entries
            .write()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))
    }
}
