//! Per-key retry coordination.
//!
//! A retry coordinator is started when a delivery for a key fails with a
//! retryable error. It keeps asking the upstream whether redeliveries for
//! the key are still outstanding, backing off between checks, until there
//! is nothing left to retry or its absolute timeout passes.
//!
//! # State Machine
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   begin generation ──► Waiting ──► Checking ──► Continue ─┘
//!   (attempt += 1,       (linear,     │
//!    persisted)           capped)     ├─ past deadline ─────► Stop(TimedOut)
//!                                     ├─ status unavailable ► Stop(StatusUnavailable)
//!                                     └─ nothing outstanding ► Stop(NothingOutstanding)
//! ```
//!
//! Every generation persists its [`RetryState`] before suspending, so a
//! process restart resumes the coordinator from the generation in progress
//! (see [`Coordinators::resume_all`]). Only the current state is kept; no
//! per-generation history accumulates. Stopping deletes the state.
//!
//! At the configured attempt threshold the coordinator raises one
//! retry-threshold notification through the throttler and keeps going.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{Notifier, OutstandingAttempts, StatusCheck};
use crate::config::{BackoffConfig, RelayConfig};
use crate::persistence::{LastErrorRecord, RetryState, StateStore, StoreError};
use crate::retry::{RetryConfig, RetryResult, retry_with_backoff};
use crate::scheduler::{EnsureOutcome, SingletonScheduler, StartError};
use crate::throttler::Notifications;
use crate::types::{InstanceKey, NotifyReason, TableKey};

#[cfg(test)]
mod tests;

/// Shortest wait before a status check. The ingestion layer reports a refused
/// batch to the upstream only after the coordinator has been started.
const MIN_WAIT: Duration = Duration::from_secs(1);

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Why a coordinator stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The coordinator outlived its retry timeout.
    TimedOut,

    /// The upstream has nothing left to redeliver.
    NothingOutstanding,

    /// The upstream status could not be obtained within its own retry budget.
    StatusUnavailable,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::TimedOut => "timed out",
            StopReason::NothingOutstanding => "nothing outstanding",
            StopReason::StatusUnavailable => "upstream status unavailable",
        })
    }
}

/// The outcome of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop(StopReason),
}

/// Starts and resumes retry coordinators.
pub struct Coordinators<U, N> {
    store: StateStore,
    scheduler: Arc<SingletonScheduler>,
    upstream: Arc<U>,
    notifications: Notifications<N>,
    backoff: BackoffConfig,
    retry_timeout: Duration,
    notify_threshold: u32,
    status_retry: RetryConfig,
}

impl<U, N> Clone for Coordinators<U, N> {
    fn clone(&self) -> Self {
        Coordinators {
            store: self.store.clone(),
            scheduler: Arc::clone(&self.scheduler),
            upstream: Arc::clone(&self.upstream),
            notifications: self.notifications.clone(),
            backoff: self.backoff,
            retry_timeout: self.retry_timeout,
            notify_threshold: self.notify_threshold,
            status_retry: self.status_retry,
        }
    }
}

impl<U: StatusCheck, N: Notifier> Coordinators<U, N> {
    pub fn new(
        config: &RelayConfig,
        store: StateStore,
        scheduler: Arc<SingletonScheduler>,
        upstream: Arc<U>,
        notifications: Notifications<N>,
    ) -> Self {
        Coordinators {
            store,
            scheduler,
            upstream,
            notifications,
            backoff: config.backoff,
            retry_timeout: config.retry_timeout,
            notify_threshold: config.notify_threshold,
            status_retry: config.status_retry,
        }
    }

    /// Ensures a coordinator is running for `key`.
    ///
    /// A new coordinator resumes from the persisted [`RetryState`] if one
    /// exists, and is seeded fresh (attempt 0, started now) otherwise.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn ensure(&self, key: &TableKey) -> EnsureOutcome {
        self.scheduler
            .ensure_running(InstanceKey::coordinator(key), || {
                let coordinator = self.prepare(key)?;
                Ok::<_, StartError>(async move {
                    coordinator.run().await;
                })
            })
            .await
    }

    /// Ensures a coordinator for every key with persisted retry state.
    ///
    /// Returns the number of coordinators started.
    pub async fn resume_all(&self) -> Result<usize> {
        let keys = self.store.keys::<RetryState>()?;
        let mut started = 0;
        for key in keys {
            let key = TableKey::new(key);
            if self.ensure(&key).await == EnsureOutcome::Started {
                started += 1;
            }
        }
        if started > 0 {
            info!(started, "Resumed retry coordinators");
        }
        Ok(started)
    }

    /// Loads or seeds the key's retry state and persists it.
    pub fn prepare(&self, key: &TableKey) -> Result<RetryCoordinator<U, N>> {
        let existing = self.store.get::<RetryState>(key.as_str())?;
        // A seed that never began a generation has no attempt to skip.
        let resumed = existing.as_ref().is_some_and(|state| state.generation > 0);
        let state = match existing {
            Some(state) => {
                debug!(key = %key, attempt = state.attempt, "Resuming persisted retry state");
                state
            }
            None => {
                let state = RetryState::seed(
                    Utc::now(),
                    self.retry_timeout,
                    self.backoff,
                    self.notify_threshold,
                );
                self.store.put(key.as_str(), &state)?;
                state
            }
        };

        Ok(RetryCoordinator {
            key: key.clone(),
            state,
            resumed,
            store: self.store.clone(),
            upstream: Arc::clone(&self.upstream),
            notifications: self.notifications.clone(),
            status_retry: self.status_retry,
        })
    }
}

/// A single key's coordinator.
pub struct RetryCoordinator<U, N> {
    key: TableKey,
    state: RetryState,

    /// The state was loaded from a previous run whose current generation
    /// already counted its attempt.
    resumed: bool,

    store: StateStore,
    upstream: Arc<U>,
    notifications: Notifications<N>,
    status_retry: RetryConfig,
}

impl<U: StatusCheck, N: Notifier> RetryCoordinator<U, N> {
    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Runs generations until the coordinator stops.
    ///
    /// Returns `None` if the state store failed. The persisted state is then
    /// left in place so a later start resumes from it.
    pub async fn run(mut self) -> Option<StopReason> {
        info!(key = %self.key, attempt = self.state.attempt, "Retry coordinator running");
        loop {
            match self.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop(reason)) => {
                    self.finish(reason);
                    return Some(reason);
                }
                Err(e) => {
                    error!(key = %self.key, error = %e, "State store failed, coordinator exiting");
                    return None;
                }
            }
        }
    }

    /// Runs one generation: begin, wait, check.
    pub async fn step(&mut self) -> Result<Step> {
        self.begin_generation()?;

        let delay = self.state.current_delay().max(MIN_WAIT);
        debug!(
            key = %self.key,
            attempt = self.state.attempt,
            generation = self.state.generation,
            delay = ?delay,
            "Waiting before status check"
        );
        tokio::time::sleep(delay).await;

        self.check().await
    }

    fn begin_generation(&mut self) -> Result<()> {
        if std::mem::take(&mut self.resumed) {
            return Ok(());
        }
        self.state.attempt = self.state.attempt.saturating_add(1);
        self.state.generation = self.state.generation.saturating_add(1);
        self.state.updated_at = Utc::now();
        self.store.put(self.key.as_str(), &self.state)
    }

    async fn check(&mut self) -> Result<Step> {
        if self.state.is_expired(Utc::now()) {
            return Ok(Step::Stop(StopReason::TimedOut));
        }

        let Some(status) = self.query_status().await else {
            return Ok(Step::Stop(StopReason::StatusUnavailable));
        };

        if status.limit_reached {
            debug!(key = %self.key, "Upstream reached its redelivery limit, re-arming");
            if let Err(e) = self.upstream.rearm(&self.key).await {
                warn!(key = %self.key, error = %e, "Failed to re-arm upstream");
            }
        }

        if status.count == 0 {
            return Ok(Step::Stop(StopReason::NothingOutstanding));
        }

        if self.state.should_notify() {
            self.escalate().await?;
        }

        debug!(key = %self.key, outstanding = status.count, "Redeliveries outstanding, continuing");
        Ok(Step::Continue)
    }

    async fn query_status(&self) -> Option<OutstandingAttempts> {
        let upstream = &*self.upstream;
        let key = &self.key;
        let result = retry_with_backoff(self.status_retry, move || {
            upstream.outstanding_attempts(key)
        })
        .await;

        match result {
            RetryResult::Success(status) => Some(status),
            RetryResult::ExhaustedRetries {
                last_error,
                attempts,
            } => {
                warn!(key = %self.key, attempts, error = %last_error, "Upstream status unavailable");
                None
            }
            RetryResult::PermanentError(e) => {
                warn!(key = %self.key, error = %e, "Upstream status request rejected");
                None
            }
        }
    }

    async fn escalate(&mut self) -> Result<()> {
        let last_error = self.store.get::<LastErrorRecord>(self.key.as_str())?;
        let mut message = format!(
            "delivery for {} still failing after {} attempts",
            self.key, self.state.attempt
        );
        if let Some(last_error) = last_error {
            message.push_str(&format!("; last error: {}", last_error.message));
        }

        let outcome = self
            .notifications
            .ensure(&self.key, NotifyReason::RetryThreshold, message)
            .await;
        debug!(key = %self.key, ?outcome, "Raised retry-threshold notification");

        self.state.threshold_notified = true;
        self.state.updated_at = Utc::now();
        self.store.put(self.key.as_str(), &self.state)
    }

    fn finish(&self, reason: StopReason) {
        info!(
            key = %self.key,
            attempt = self.state.attempt,
            %reason,
            "Retry coordinator stopped"
        );
        if let Err(e) = self.store.delete::<RetryState>(self.key.as_str()) {
            warn!(key = %self.key, error = %e, "Failed to clear retry state");
        }
    }
}
