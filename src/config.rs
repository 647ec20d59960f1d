//! Relay configuration.
//!
//! All tunables live in one [`RelayConfig`] that is passed to each component
//! at construction. [`RelayConfig::from_env`] reads `RELAY_*` environment
//! variables; anything missing or unparseable falls back to the default.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `RELAY_ALLOWED_COLUMNS` | static allow-lists, `key=a,b;key2=c` | none |
//! | `RELAY_BACKOFF_BASE_SECS` | coordinator backoff base | 60 |
//! | `RELAY_BACKOFF_STEP_SECS` | added per attempt | 60 |
//! | `RELAY_BACKOFF_MAX_SECS` | backoff ceiling | 900 |
//! | `RELAY_RETRY_TIMEOUT_SECS` | coordinator lifetime | 86400 |
//! | `RELAY_NOTIFY_THRESHOLD` | attempt that raises an alert (0 disables) | 10 |
//! | `RELAY_NOTIFY_COOLDOWN_SECS` | duplicate-alert suppression window | 21600 |
//! | `RELAY_SINK_TIMEOUT_SECS` | hard timeout on one sink call | 30 |

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::retry::RetryConfig;
use crate::types::TableKey;

const DEFAULT_BACKOFF_BASE_SECS: u64 = 60;
const DEFAULT_BACKOFF_STEP_SECS: u64 = 60;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 15 * 60;
const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_NOTIFY_THRESHOLD: u32 = 10;
const DEFAULT_NOTIFY_COOLDOWN_SECS: u64 = 6 * 60 * 60;
const DEFAULT_SINK_TIMEOUT_SECS: u64 = 30;

/// Linear, capped backoff for retry coordinator generations.
///
/// The wait before the check of attempt `n` is `min(base + n * step, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl BackoffConfig {
    pub fn new(base: Duration, step: Duration, max: Duration) -> Self {
        BackoffConfig { base, step, max }
    }

    /// Returns the wait for the given attempt count.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ramp = self
            .step
            .checked_mul(attempt)
            .and_then(|ramp| self.base.checked_add(ramp))
            .unwrap_or(Duration::MAX);
        ramp.min(self.max)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            step: Duration::from_secs(DEFAULT_BACKOFF_STEP_SECS),
            max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

/// Configuration shared by every relay component.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Process-wide allow-lists, as comma-separated column names per key.
    pub static_allowed_columns: HashMap<TableKey, String>,

    /// Wait between coordinator generations.
    pub backoff: BackoffConfig,

    /// Absolute lifetime of one coordinator run.
    pub retry_timeout: Duration,

    /// Attempt count that raises a retry-threshold notification. 0 disables it.
    pub notify_threshold: u32,

    /// How long a throttler suppresses duplicates after sending.
    /// Zero disables the hold.
    pub notify_cooldown: Duration,

    /// Hard timeout on a single sink call.
    pub sink_timeout: Duration,

    /// Retry policy for the upstream status check.
    pub status_retry: RetryConfig,

    /// Retry policy for the notify sink.
    pub notify_retry: RetryConfig,

    /// Retry policy for starting a singleton instance.
    pub start_retry: RetryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        RelayConfig {
            static_allowed_columns: HashMap::new(),
            backoff: BackoffConfig::default(),
            retry_timeout: Duration::from_secs(DEFAULT_RETRY_TIMEOUT_SECS),
            notify_threshold: DEFAULT_NOTIFY_THRESHOLD,
            notify_cooldown: Duration::from_secs(DEFAULT_NOTIFY_COOLDOWN_SECS),
            sink_timeout: Duration::from_secs(DEFAULT_SINK_TIMEOUT_SECS),
            status_retry: RetryConfig::STATUS_CHECK,
            notify_retry: RetryConfig::NOTIFY,
            start_retry: RetryConfig::START,
        }
    }

    /// Creates a configuration from `RELAY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Creates a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |name: &str, default: u64| {
            Duration::from_secs(parse_or(&lookup, name, default))
        };

        let defaults = Self::new();
        RelayConfig {
            static_allowed_columns: lookup("RELAY_ALLOWED_COLUMNS")
                .map(|raw| parse_allowed_columns(&raw))
                .unwrap_or_default(),
            backoff: BackoffConfig {
                base: secs("RELAY_BACKOFF_BASE_SECS", DEFAULT_BACKOFF_BASE_SECS),
                step: secs("RELAY_BACKOFF_STEP_SECS", DEFAULT_BACKOFF_STEP_SECS),
                max: secs("RELAY_BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS),
            },
            retry_timeout: secs("RELAY_RETRY_TIMEOUT_SECS", DEFAULT_RETRY_TIMEOUT_SECS),
            notify_threshold: parse_or(&lookup, "RELAY_NOTIFY_THRESHOLD", DEFAULT_NOTIFY_THRESHOLD),
            notify_cooldown: secs("RELAY_NOTIFY_COOLDOWN_SECS", DEFAULT_NOTIFY_COOLDOWN_SECS),
            sink_timeout: secs("RELAY_SINK_TIMEOUT_SECS", DEFAULT_SINK_TIMEOUT_SECS),
            ..defaults
        }
    }

    /// Sets the static allow-list for a key.
    pub fn with_allowed_columns(mut self, key: impl Into<TableKey>, columns: impl Into<String>) -> Self {
        self.static_allowed_columns.insert(key.into(), columns.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    pub fn with_notify_threshold(mut self, notify_threshold: u32) -> Self {
        self.notify_threshold = notify_threshold;
        self
    }

    pub fn with_notify_cooldown(mut self, notify_cooldown: Duration) -> Self {
        self.notify_cooldown = notify_cooldown;
        self
    }

    pub fn with_sink_timeout(mut self, sink_timeout: Duration) -> Self {
        self.sink_timeout = sink_timeout;
        self
    }

    pub fn with_status_retry(mut self, status_retry: RetryConfig) -> Self {
        self.status_retry = status_retry;
        self
    }

    pub fn with_notify_retry(mut self, notify_retry: RetryConfig) -> Self {
        self.notify_retry = notify_retry;
        self
    }

    pub fn with_start_retry(mut self, start_retry: RetryConfig) -> Self {
        self.start_retry = start_retry;
        self
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    match lookup(name) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "Ignoring unparseable setting");
                default
            }
        },
        None => default,
    }
}

/// Parses `key=a,b;key2=c` into per-key column lists.
///
/// Entries without `=` or with an empty key are skipped.
pub fn parse_allowed_columns(raw: &str) -> HashMap<TableKey, String> {
    raw.split(';')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, columns)) if !key.trim().is_empty() => {
                Some((TableKey::new(key.trim()), columns.trim().to_string()))
            }
            _ => {
                warn!(entry, "Ignoring malformed allow-list entry");
                None
            }
        })
        .collect()
}
