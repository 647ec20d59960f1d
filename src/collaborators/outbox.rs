//! Durable JSON Lines outbox used as the binary's downstream sink.
//!
//! Each delivered batch becomes one line in `<outbox_dir>/<escaped key>.jsonl`:
//!
//! ```json
//! {"delivered_at":"2024-01-15T10:00:00Z","key":"T1","records":[{"key":"T1","operation":"insert","fields":{"Id":1}}]}
//! ```
//!
//! A line is written with a single `write_all` and fsynced before `send`
//! returns, so an acknowledged batch survives a crash. A `send` abandoned by
//! a timeout may still finish its append in the background; the batch is
//! then present twice once it is redelivered. A partial last line
//! from a crash mid-write is skipped by [`read_outbox`].

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Sink;
use crate::delivery::DeliveryError;
use crate::persistence::{escape_key, fsync_file};
use crate::types::{ChangeRecord, TableKey};

/// One delivered batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub delivered_at: DateTime<Utc>,
    pub key: TableKey,
    pub records: Vec<ChangeRecord>,
}

/// Sink that appends batches to per-key JSON Lines files.
///
/// The append and its fsync run on the blocking pool, so the caller's
/// timeout keeps working while the disk is slow.
#[derive(Debug)]
pub struct OutboxSink {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl OutboxSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        OutboxSink {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn encode(key: &TableKey, batch: &[ChangeRecord]) -> Result<Vec<u8>, DeliveryError> {
        let entry = OutboxEntry {
            delivered_at: Utc::now(),
            key: key.clone(),
            records: batch.to_vec(),
        };

        // A batch that cannot be serialized never will be.
        let mut line = serde_json::to_vec(&entry).map_err(|e| {
            DeliveryError::permanent(format!("batch is not serializable: {}", e)).with_source(e)
        })?;
        line.push(b'\n');
        Ok(line)
    }
}

fn append_line(lock: &Mutex<()>, dir: &Path, path: &Path, line: &[u8]) -> Result<(), DeliveryError> {
    let _guard = lock
        .lock()
        .map_err(|_| DeliveryError::transient("outbox writer lock poisoned"))?;

    let io_error =
        |e: io::Error| DeliveryError::transient(format!("outbox write failed: {}", e)).with_source(e);

    std::fs::create_dir_all(dir).map_err(io_error)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)?;
    file.write_all(line).map_err(io_error)?;
    fsync_file(&file).map_err(io_error)?;
    Ok(())
}

impl Sink for OutboxSink {
    async fn send(&self, key: &TableKey, batch: &[ChangeRecord]) -> Result<(), DeliveryError> {
        let line = Self::encode(key, batch)?;
        let lock = Arc::clone(&self.write_lock);
        let dir = self.dir.clone();
        let path = outbox_path(&self.dir, key);

        tokio::task::spawn_blocking(move || append_line(&lock, &dir, &path, &line))
            .await
            .map_err(|e| DeliveryError::transient(format!("outbox writer task failed: {}", e)))?
    }
}

/// Returns the outbox file for `key` under `dir`.
pub fn outbox_path(dir: &Path, key: &TableKey) -> PathBuf {
    dir.join(format!("{}.jsonl", escape_key(key.as_str())))
}

/// Reads every complete entry in a key's outbox file.
///
/// A missing file yields no entries. Reading stops at the first line that
/// does not parse (a torn write from a crash).
pub fn read_outbox(dir: &Path, key: &TableKey) -> io::Result<Vec<OutboxEntry>> {
    let file = match std::fs::File::open(outbox_path(dir, key)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
    }
    Ok(entries)
}
