//! Newtype wrappers for the identifiers that scope relay state.
//!
//! Every piece of persisted state, every retry coordinator and every
//! notification throttler is scoped by a [`TableKey`]. Throttlers are further
//! scoped by a [`NotifyReason`], and the scheduler's registry is keyed by the
//! combined [`InstanceKey`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// The identifier of a change-feed source (usually a table or topic name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableKey(String);

impl TableKey {
    pub fn new(s: impl Into<String>) -> Self {
        TableKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TableKey {
    fn from(s: String) -> Self {
        TableKey(s)
    }
}

impl From<&str> for TableKey {
    fn from(s: &str) -> Self {
        TableKey(s.to_string())
    }
}

/// Why a notification is being raised.
///
/// Each reason gets its own throttler and its own suppression window, so a
/// non-retryable failure alert never masks a retry-threshold alert for the
/// same key (and vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyReason {
    /// The sink refused a batch with an explicit non-retry marker.
    NonRetryable,

    /// A retry coordinator reached the configured attempt threshold.
    RetryThreshold,
}

impl NotifyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyReason::NonRetryable => "non-retryable",
            NotifyReason::RetryThreshold => "retry-threshold",
        }
    }
}

impl fmt::Display for NotifyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry key for a singleton background instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceKey {
    /// The retry coordinator for a key.
    Coordinator(TableKey),

    /// The notification throttler for a (key, reason) pair.
    Throttler(TableKey, NotifyReason),
}

impl InstanceKey {
    pub fn coordinator(key: &TableKey) -> Self {
        InstanceKey::Coordinator(key.clone())
    }

    pub fn throttler(key: &TableKey, reason: NotifyReason) -> Self {
        InstanceKey::Throttler(key.clone(), reason)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::Coordinator(key) => write!(f, "coordinator:{}", key),
            InstanceKey::Throttler(key, reason) => write!(f, "throttler:{}:{}", key, reason),
        }
    }
}
