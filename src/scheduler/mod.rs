//! Singleton scheduling of background instances.
//!
//! The scheduler guarantees at most one running instance per [`InstanceKey`]:
//! one retry coordinator per table key, one notification throttler per
//! `(key, reason)`. It does this with a registry of running instances rather
//! than by holding locks across work.
//!
//! # Instance Lifecycle
//!
//! ```text
//! ensure_running(key, factory)
//!   ├─ key registered ──────────────► AlreadyRunning (no-op)
//!   └─ reserve slot
//!        ├─ factory() ok ────────────► spawn task ──► Started
//!        │                              └─ task ends ──► slot released
//!        └─ factory() fails N times ─► slot released ──► GaveUp (logged)
//! ```
//!
//! Instances are spawned as tokio tasks under a child of the scheduler's
//! shutdown token, so [`SingletonScheduler::shutdown`] stops all of them.
//! A task releases its slot only if the slot still belongs to it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::persistence::StoreError;
use crate::retry::{RetryConfig, RetryResult, Transience, retry_with_backoff};
use crate::types::InstanceKey;

/// Why an instance could not be started.
#[derive(Debug, Error)]
pub enum StartError {
    /// The instance's initial state could not be loaded or persisted.
    #[error("state store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl Transience for StartError {
    fn is_transient(&self) -> bool {
        true
    }
}

/// The result of [`SingletonScheduler::ensure_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A new instance was spawned.
    Started,

    /// An instance with this key is already active; nothing was done.
    AlreadyRunning,

    /// Every start attempt failed. A later call may try again.
    GaveUp,
}

/// Running instances, each tagged with the id of the task that owns the slot.
type Registry = HashMap<InstanceKey, u64>;

/// Starts background instances at most once per key.
pub struct SingletonScheduler {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
    start_retry: RetryConfig,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SingletonScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonScheduler")
            .field("start_retry", &self.start_retry)
            .finish_non_exhaustive()
    }
}

impl SingletonScheduler {
    /// Creates a scheduler with its own shutdown token.
    pub fn new(start_retry: RetryConfig) -> Self {
        Self::new_with_shutdown(start_retry, CancellationToken::new())
    }

    /// Creates a scheduler whose instances stop when `shutdown` is cancelled.
    pub fn new_with_shutdown(start_retry: RetryConfig, shutdown: CancellationToken) -> Self {
        SingletonScheduler {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            start_retry,
            shutdown,
        }
    }

    /// Ensures an instance for `key` is running, starting one via `factory` if not.
    ///
    /// `factory` is called once per start attempt. Start failures are retried
    /// according to the scheduler's start policy and then given up on
    /// silently: a later failure on the same key will call this again.
    #[instrument(skip(self, factory), fields(instance = %key))]
    pub async fn ensure_running<F, Fut>(&self, key: InstanceKey, mut factory: F) -> EnsureOutcome
    where
        F: FnMut() -> Result<Fut, StartError>,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            debug!("Scheduler is shut down, not starting instance");
            return EnsureOutcome::GaveUp;
        }

        let id = {
            let mut registry = self.registry.lock().await;
            if registry.contains_key(&key) {
                debug!("Instance already running");
                return EnsureOutcome::AlreadyRunning;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            registry.insert(key.clone(), id);
            id
        };

        let result = retry_with_backoff(self.start_retry, || {
            std::future::ready(factory())
        })
        .await;

        match result {
            RetryResult::Success(instance) => {
                self.spawn(key, id, instance);
                EnsureOutcome::Started
            }
            RetryResult::ExhaustedRetries {
                last_error,
                attempts,
            } => {
                warn!(error = %last_error, attempts, "Giving up starting instance");
                release(&self.registry, &key, id).await;
                EnsureOutcome::GaveUp
            }
            RetryResult::PermanentError(error) => {
                warn!(error = %error, "Instance cannot be started");
                release(&self.registry, &key, id).await;
                EnsureOutcome::GaveUp
            }
        }
    }

    fn spawn<Fut>(&self, key: InstanceKey, id: u64, instance: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let cancel = self.shutdown.child_token();

        info!(instance = %key, "Starting instance");
        tokio::spawn(async move {
            tokio::select! {
                () = instance => {
                    debug!(instance = %key, "Instance finished");
                }
                () = cancel.cancelled() => {
                    debug!(instance = %key, "Instance cancelled by shutdown");
                }
            }
            release(&registry, &key, id).await;
        });
    }

    /// Returns true if an instance for `key` is active.
    pub async fn is_running(&self, key: &InstanceKey) -> bool {
        self.registry.lock().await.contains_key(key)
    }

    /// Returns the number of active instances.
    pub async fn running_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Stops every running instance and refuses new ones.
    pub fn shutdown(&self) {
        info!("Shutting down scheduled instances");
        self.shutdown.cancel();
    }
}

async fn release(registry: &Mutex<Registry>, key: &InstanceKey, id: u64) {
    let mut registry = registry.lock().await;
    if registry.get(key) == Some(&id) {
        registry.remove(key);
    }
}
