//! Notification throttling.
//!
//! A throttler is a singleton per `(key, reason)`. On start it sends its
//! message through the [`Notifier`], then keeps its scheduler slot for the
//! cool-down window. While the slot is held, further requests for the same
//! pair observe [`EnsureOutcome::AlreadyRunning`] and are dropped.
//!
//! The suppression window is also persisted as a [`NotificationState`], so
//! a process restarted inside the window does not resend: the new instance
//! holds the slot until the persisted `suppressed_until` instead.
//!
//! Notifier failures never leave the throttler. They are retried per the
//! notify policy and then recorded as the key's [`LastErrorRecord`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{Notification, Notifier};
use crate::config::RelayConfig;
use crate::persistence::{LastErrorRecord, NotificationState, StateStore};
use crate::retry::{RetryConfig, RetryResult, retry_with_backoff};
use crate::scheduler::{EnsureOutcome, SingletonScheduler, StartError};
use crate::types::{InstanceKey, NotifyReason, TableKey};

/// Starts notification throttlers.
pub struct Notifications<N> {
    store: StateStore,
    scheduler: Arc<SingletonScheduler>,
    notifier: Arc<N>,
    cooldown: Duration,
    notify_retry: RetryConfig,
}

impl<N> Clone for Notifications<N> {
    fn clone(&self) -> Self {
        Notifications {
            store: self.store.clone(),
            scheduler: Arc::clone(&self.scheduler),
            notifier: Arc::clone(&self.notifier),
            cooldown: self.cooldown,
            notify_retry: self.notify_retry,
        }
    }
}

impl<N: Notifier> Notifications<N> {
    pub fn new(
        config: &RelayConfig,
        store: StateStore,
        scheduler: Arc<SingletonScheduler>,
        notifier: Arc<N>,
    ) -> Self {
        Notifications {
            store,
            scheduler,
            notifier,
            cooldown: config.notify_cooldown,
            notify_retry: config.notify_retry,
        }
    }

    /// Ensures a throttler is running for `(key, reason)` with `message`.
    ///
    /// If one is already running the message is dropped.
    #[instrument(skip(self, message), fields(key = %key, reason = %reason))]
    pub async fn ensure(
        &self,
        key: &TableKey,
        reason: NotifyReason,
        message: impl Into<String>,
    ) -> EnsureOutcome {
        let message = message.into();
        let instance = InstanceKey::throttler(key, reason);

        self.scheduler
            .ensure_running(instance, || {
                let previous = self
                    .store
                    .get::<NotificationState>(&NotificationState::store_key(key, reason))?;
                let throttler = Throttler {
                    key: key.clone(),
                    reason,
                    message: message.clone(),
                    store: self.store.clone(),
                    notifier: Arc::clone(&self.notifier),
                    cooldown: self.cooldown,
                    notify_retry: self.notify_retry,
                };
                Ok::<_, StartError>(throttler.run(previous))
            })
            .await
    }
}

/// One running throttler instance.
struct Throttler<N> {
    key: TableKey,
    reason: NotifyReason,
    message: String,
    store: StateStore,
    notifier: Arc<N>,
    cooldown: Duration,
    notify_retry: RetryConfig,
}

impl<N: Notifier> Throttler<N> {
    async fn run(self, previous: Option<NotificationState>) {
        let now = Utc::now();
        if let Some(previous) = &previous
            && previous.is_suppressing(now)
        {
            debug!(
                key = %self.key,
                reason = %self.reason,
                until = %previous.suppressed_until,
                "Still inside a persisted cool-down, not resending"
            );
            tokio::time::sleep(remaining(now, previous.suppressed_until)).await;
            return;
        }

        let delivered = self.send().await;
        let sent_at = Utc::now();

        let state = NotificationState {
            last_sent_at: if delivered {
                Some(sent_at)
            } else {
                previous.and_then(|p| p.last_sent_at)
            },
            suppressed_until: suppression_end(sent_at, self.cooldown),
            last_message: self.message.clone(),
        };
        let store_key = NotificationState::store_key(&self.key, self.reason);
        if let Err(e) = self.store.put(&store_key, &state) {
            warn!(key = %self.key, reason = %self.reason, error = %e, "Failed to persist notification state");
        }

        if !self.cooldown.is_zero() {
            debug!(key = %self.key, reason = %self.reason, cooldown = ?self.cooldown, "Holding cool-down");
            tokio::time::sleep(self.cooldown).await;
        }
    }

    /// Sends the notification. Returns whether it was delivered.
    async fn send(&self) -> bool {
        let notification = Notification {
            key: self.key.clone(),
            reason: self.reason,
            message: self.message.clone(),
            raised_at: Utc::now(),
        };
        let notifier = &*self.notifier;
        let notification_ref = &notification;

        let result = retry_with_backoff(self.notify_retry, move || {
            notifier.notify(notification_ref)
        })
        .await;

        let error = match result {
            RetryResult::Success(()) => {
                info!(key = %self.key, reason = %self.reason, "Notification sent");
                return true;
            }
            RetryResult::ExhaustedRetries {
                last_error,
                attempts,
            } => {
                warn!(key = %self.key, reason = %self.reason, attempts, error = %last_error, "Notification retries exhausted");
                last_error
            }
            RetryResult::PermanentError(e) => {
                warn!(key = %self.key, reason = %self.reason, error = %e, "Notification rejected");
                e
            }
        };

        let record = LastErrorRecord::new(
            format!("{} notification failed: {}", self.reason, error),
            Utc::now(),
        );
        if let Err(e) = self.store.put(self.key.as_str(), &record) {
            warn!(key = %self.key, error = %e, "Failed to record notification failure");
        }
        false
    }
}

fn suppression_end(sent_at: DateTime<Utc>, cooldown: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(cooldown)
        .ok()
        .and_then(|cooldown| sent_at.checked_add_signed(cooldown))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn remaining(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}
