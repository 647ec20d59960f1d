//! Typed keyed state store with per-key atomic read-modify-write.
//!
//! Records are wrapped in a small versioned envelope before being handed to
//! the backend:
//!
//! ```json
//! {"schema_version":1,"record":{"message":"timeout","occurred_at":"2024-01-15T10:00:00Z"}}
//! ```
//!
//! Writers for one key are serialized by a per-`(namespace, key)` mutex, so
//! [`StateStore::update`] is atomic with respect to every other store call on
//! the same record. Locks are never held across an `.await`.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::backend::{FileBackend, MemoryBackend, Namespace, StateBackend};

/// Current record envelope version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted record was written by an incompatible version.
    #[error("schema version mismatch in {namespace}/{key}: expected {expected}, got {got}")]
    SchemaMismatch {
        namespace: Namespace,
        key: String,
        expected: u32,
        got: u32,
    },

    /// The key cannot be stored (currently: empty keys).
    #[error("invalid state key: {0:?}")]
    InvalidKey(String),

    /// The key's escaped form does not fit in a file name.
    #[error("state key too long: escapes to {escaped} bytes, limit is {limit}")]
    KeyTooLong { escaped: usize, limit: usize },

    /// A writer panicked while holding a store lock.
    #[error("state store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether the error is about the key itself rather than the storage.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, StoreError::InvalidKey(_) | StoreError::KeyTooLong { .. })
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A record type that lives in exactly one namespace.
pub trait Record: Serialize + DeserializeOwned {
    const NAMESPACE: Namespace;
}

#[derive(Serialize, Deserialize)]
struct Envelope<R> {
    schema_version: u32,
    record: R,
}

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

type LockMap = HashMap<(Namespace, String), Arc<Mutex<()>>>;

/// Shared handle to the keyed state store. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    locks: Arc<Mutex<LockMap>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Creates a store over an arbitrary backend.
    pub fn new(backend: impl StateBackend + 'static) -> Self {
        StateStore {
            backend: Arc::new(backend),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a durable store rooted at `state_dir`.
    pub fn open(state_dir: impl Into<std::path::PathBuf>) -> Self {
        Self::new(FileBackend::new(state_dir))
    }

    /// Creates a non-durable in-memory store.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Runs `f` while holding the lock for `(namespace, key)`.
    ///
    /// The lock entry is dropped from the map once no other caller holds or
    /// waits on it, so the map only ever contains keys in use.
    fn with_key_lock<T>(
        &self,
        namespace: Namespace,
        key: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| StoreError::Poisoned)?;
            Arc::clone(locks.entry((namespace, key.to_string())).or_default())
        };

        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(StoreError::Poisoned),
        };

        if let Ok(mut locks) = self.locks.lock() {
            // One reference in the map, one here: nobody else is waiting.
            if Arc::strong_count(&lock) == 2 {
                locks.remove(&(namespace, key.to_string()));
            }
        }
        result
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().map_or(0, |locks| locks.len())
    }

    fn read_unlocked<R: Record>(&self, key: &str) -> Result<Option<R>> {
        let Some(bytes) = self.backend.read(R::NAMESPACE, key)? else {
            return Ok(None);
        };

        let probe: VersionProbe = serde_json::from_slice(&bytes)?;
        if probe.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                namespace: R::NAMESPACE,
                key: key.to_string(),
                expected: SCHEMA_VERSION,
                got: probe.schema_version,
            });
        }

        let envelope: Envelope<R> = serde_json::from_slice(&bytes)?;
        Ok(Some(envelope.record))
    }

    fn write_unlocked<R: Record>(&self, key: &str, record: &R) -> Result<()> {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            record,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.backend.write(R::NAMESPACE, key, &bytes)
    }

    /// Reads the record stored under `key`.
    pub fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
        self.with_key_lock(R::NAMESPACE, key, || self.read_unlocked(key))
    }

    /// Replaces the record stored under `key`.
    pub fn put<R: Record>(&self, key: &str, record: &R) -> Result<()> {
        self.with_key_lock(R::NAMESPACE, key, || self.write_unlocked(key, record))
    }

    /// Deletes the record stored under `key`, returning whether it existed.
    pub fn delete<R: Record>(&self, key: &str) -> Result<bool> {
        self.with_key_lock(R::NAMESPACE, key, || self.backend.remove(R::NAMESPACE, key))
    }

    /// Atomically reads, transforms and writes back the record under `key`.
    ///
    /// `f` receives the current record (if any) and returns the new one;
    /// returning `None` deletes the record. The new value is returned.
    pub fn update<R, F>(&self, key: &str, f: F) -> Result<Option<R>>
    where
        R: Record + Clone,
        F: FnOnce(Option<R>) -> Option<R>,
    {
        self.with_key_lock(R::NAMESPACE, key, || {
            let current = self.read_unlocked::<R>(key)?;
            let next = f(current);
            match &next {
                Some(record) => self.write_unlocked(key, record)?,
                None => {
                    self.backend.remove(R::NAMESPACE, key)?;
                }
            }
            Ok(next)
        })
    }

    /// Lists every key that has a record of type `R`.
    pub fn keys<R: Record>(&self) -> Result<Vec<String>> {
        self.backend.keys(R::NAMESPACE)
    }
}
