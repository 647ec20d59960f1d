//! Record types persisted in the keyed state store.
//!
//! One record of each type per key, except [`NotificationState`], which is
//! stored per `(key, reason)` under [`NotificationState::store_key`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backend::Namespace;
use super::store::Record;
use crate::config::BackoffConfig;
use crate::types::{NotifyReason, TableKey};

/// The most recent failure observed for a key. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastErrorRecord {
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl LastErrorRecord {
    pub fn new(message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        LastErrorRecord {
            message: message.into(),
            occurred_at,
        }
    }
}

impl Record for LastErrorRecord {
    const NAMESPACE: Namespace = Namespace::LastError;
}

/// Client-set allow-list override for a key.
///
/// `columns` holds the names exactly as supplied (trimmed, blanks dropped);
/// case folding happens when the filter builds its lookup set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAllowedColumns {
    pub columns: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Record for ClientAllowedColumns {
    const NAMESPACE: Namespace = Namespace::AllowedColumns;
}

/// Persisted progress of a key's retry coordinator.
///
/// Written before every suspension, so a restarted process resumes the
/// coordinator from the last generation that began.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Attempts made so far. Incremented once per generation.
    pub attempt: u32,

    /// Generations begun by this coordinator lifetime.
    pub generation: u64,

    /// When the coordinator was first started for the current failure run.
    pub started_at: DateTime<Utc>,

    /// Absolute lifetime of the coordinator, measured from `started_at`.
    pub timeout: Duration,

    /// Backoff parameters captured at start, so a config change does not
    /// alter a run already in progress.
    pub backoff: BackoffConfig,

    /// Attempt count at which a retry-threshold notification is raised.
    pub notify_threshold: u32,

    /// Whether the retry-threshold notification already fired.
    #[serde(default)]
    pub threshold_notified: bool,

    pub updated_at: DateTime<Utc>,
}

impl RetryState {
    /// Seeds a fresh state: attempt 0, started now.
    pub fn seed(
        now: DateTime<Utc>,
        timeout: Duration,
        backoff: BackoffConfig,
        notify_threshold: u32,
    ) -> Self {
        RetryState {
            attempt: 0,
            generation: 0,
            started_at: now,
            timeout,
            backoff,
            notify_threshold,
            threshold_notified: false,
            updated_at: now,
        }
    }

    /// Returns the instant after which the coordinator must stop.
    pub fn deadline(&self) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        self.started_at
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns true if `now` is past the coordinator's absolute timeout.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline()
    }

    /// Delay before the check of the current generation.
    pub fn current_delay(&self) -> Duration {
        self.backoff.delay_for_attempt(self.attempt)
    }

    /// Returns true if the current attempt should raise the threshold alert.
    pub fn should_notify(&self) -> bool {
        !self.threshold_notified && self.notify_threshold > 0 && self.attempt == self.notify_threshold
    }
}

impl Record for RetryState {
    const NAMESPACE: Namespace = Namespace::RetryState;
}

/// Suppression bookkeeping for one `(key, reason)` throttler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationState {
    /// When the notification was last delivered, if it ever was.
    pub last_sent_at: Option<DateTime<Utc>>,

    /// Duplicates are suppressed until this instant.
    pub suppressed_until: DateTime<Utc>,

    pub last_message: String,
}

impl NotificationState {
    /// The state-store key for a `(key, reason)` pair.
    pub fn store_key(key: &TableKey, reason: NotifyReason) -> String {
        format!("{}:{}", key, reason)
    }

    pub fn is_suppressing(&self, now: DateTime<Utc>) -> bool {
        now < self.suppressed_until
    }
}

impl Record for NotificationState {
    const NAMESPACE: Namespace = Namespace::Notification;
}

/// Count of failed deliveries the upstream still has to redeliver for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryRecord {
    pub outstanding: u32,
    pub updated_at: DateTime<Utc>,
}

impl Record for RedeliveryRecord {
    const NAMESPACE: Namespace = Namespace::Redelivery;
}
