//! Keyed durable state shared by the filter, pipeline, coordinators and throttlers.
//!
//! # Architecture
//!
//! - **Backend** ([`backend`]): byte blobs keyed by `(namespace, key)`. The
//!   file backend writes one JSON file per record; the memory backend is for
//!   tests.
//! - **Store** ([`store`]): typed records in a versioned envelope, with
//!   per-key atomic read-modify-write.
//! - **Records** ([`records`]): last error, client allow-list, retry state,
//!   notification state and redelivery counts.
//!
//! # Crash Safety
//!
//! - Records are written atomically using write-to-temp-then-rename
//! - Both the file and its directory are fsynced before a write returns
//! - Leftover temp files from an interrupted write are ignored on listing

pub mod backend;
pub mod durable;
pub mod records;
pub mod store;

pub use backend::{
    FileBackend, MemoryBackend, Namespace, StateBackend, check_table_key,
    escape_key, unescape_key,
};
pub use durable::{fsync_dir, fsync_file, remove_durable, write_atomic};
pub use records::{
    ClientAllowedColumns, LastErrorRecord, NotificationState, RedeliveryRecord, RetryState,
};
pub use store::{Record, SCHEMA_VERSION, StateStore, StoreError};
