//! Byte-level storage backends for the keyed state store.
//!
//! A backend maps `(namespace, key)` to an opaque byte blob. It knows nothing
//! about record types or locking; [`StateStore`](super::store::StateStore)
//! layers typed access and per-key atomic read-modify-write on top.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   last_error/<escaped key>.json
//!   allowed_columns/<escaped key>.json
//!   retry_state/<escaped key>.json
//!   notification/<escaped key>.json
//!   redelivery/<escaped key>.json
//! ```
//!
//! Keys are escaped with [`escape_key`] so arbitrary table names (including
//! ones with `/`, `:` or a leading dot) map to safe, reversible file names.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use super::durable::{remove_durable, write_atomic};
use super::store::StoreError;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Logical partition of the state store. One record per key per namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    LastError,
    AllowedColumns,
    RetryState,
    Notification,
    Redelivery,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::LastError => "last_error",
            Namespace::AllowedColumns => "allowed_columns",
            Namespace::RetryState => "retry_state",
            Namespace::Notification => "notification",
            Namespace::Redelivery => "redelivery",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable byte storage keyed by `(namespace, key)`.
pub trait StateBackend: Send + Sync {
    /// Reads the blob stored under `key`, or `None` if absent.
    fn read(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replaces the blob stored under `key`. Must be durable when this returns.
    fn write(&self, namespace: Namespace, key: &str, bytes: &[u8]) -> Result<()>;

    /// Deletes the blob stored under `key`, returning whether it existed.
    fn remove(&self, namespace: Namespace, key: &str) -> Result<bool>;

    /// Lists every key present in `namespace`, sorted.
    fn keys(&self, namespace: Namespace) -> Result<Vec<String>>;
}

/// Longest escaped key a record file can be named after. Leaves room for the
/// `.json.tmp` suffix within the common 255-byte file name limit.
pub const MAX_ESCAPED_KEY_LEN: usize = 240;

/// Longest escaped table key accepted from clients. The remainder of
/// [`MAX_ESCAPED_KEY_LEN`] is left for derived keys such as
/// `<table key>:<notify reason>`.
pub const MAX_TABLE_KEY_LEN: usize = 200;

fn passes_through(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

/// Escapes a key into a file-name-safe form.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX` (uppercase hex). `.` is escaped too, so no escaped key can be `.`,
/// `..` or a hidden file.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(escaped_len(key));
    for byte in key.bytes() {
        if passes_through(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Length of `escape_key(key)` without building it.
pub fn escaped_len(key: &str) -> usize {
    key.bytes()
        .map(|byte| if passes_through(byte) { 1 } else { 3 })
        .sum()
}

/// Reverses [`escape_key`]. Returns `None` for malformed input.
pub fn unescape_key(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn check_len(key: &str, limit: usize) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    let escaped = escaped_len(key);
    if escaped > limit {
        return Err(StoreError::KeyTooLong { escaped, limit });
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    check_len(key, MAX_ESCAPED_KEY_LEN)
}

/// Rejects table keys that cannot be stored alongside their derived keys.
pub fn check_table_key(key: &str) -> Result<()> {
    check_len(key, MAX_TABLE_KEY_LEN)
}

/// File-per-record backend rooted at a state directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Creates a backend rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileBackend { root: root.into() }
    }

    /// Returns the file that holds `key` in `namespace`.
    pub fn record_path(&self, namespace: Namespace, key: &str) -> PathBuf {
        self.root
            .join(namespace.as_str())
            .join(format!("{}.json", escape_key(key)))
    }
}

impl StateBackend for FileBackend {
    fn read(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match std::fs::read(self.record_path(namespace, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, namespace: Namespace, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        write_atomic(&self.record_path(namespace, key), bytes)?;
        Ok(())
    }

    fn remove(&self, namespace: Namespace, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(remove_durable(&self.record_path(namespace, key))?)
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        let dir = self.root.join(namespace.as_str());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            // Leftover `.json.tmp` files from an interrupted write are skipped.
            if let Some(escaped) = name.strip_suffix(".json")
                && let Some(key) = unescape_key(escaped)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory backend. Not durable; used in tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<Namespace, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for MemoryBackend {
    fn read(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .get(&namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn write(&self, namespace: Namespace, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records
            .entry(namespace)
            .or_default()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, namespace: Namespace, key: &str) -> Result<bool> {
        validate_key(key)?;
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .get_mut(&namespace)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .get(&namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}
