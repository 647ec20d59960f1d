//! The assembled relay.
//!
//! [`Relay`] wires the field filter, delivery pipeline, retry coordinators
//! and notification throttlers around one state store and one singleton
//! scheduler. It is the surface the ingestion layer and the HTTP server use.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collaborators::{Notifier, Sink, StatusCheck};
use crate::config::RelayConfig;
use crate::coordinator::Coordinators;
use crate::delivery::{DeliveryOutcome, Pipeline, PipelineError};
use crate::filter::FieldFilter;
use crate::persistence::{LastErrorRecord, RetryState, StateStore, StoreError, check_table_key};
use crate::scheduler::SingletonScheduler;
use crate::throttler::Notifications;
use crate::types::{Batch, InstanceKey, TableKey};

/// Diagnostic view of one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyState {
    pub key: TableKey,
    pub last_error: Option<LastErrorRecord>,
    pub retry_state: Option<RetryState>,
    pub coordinator_running: bool,

    /// The client-set override, as stored.
    pub client_allowed_columns: Option<String>,

    /// The union of static and client lists, folded to lower case.
    pub effective_allowed_columns: Option<Vec<String>>,
}

/// The relay: filtering, delivery and retry coordination for every key.
pub struct Relay<S, U, N> {
    store: StateStore,
    scheduler: Arc<SingletonScheduler>,
    pipeline: Pipeline<S, U, N>,
    coordinators: Coordinators<U, N>,
}

impl<S, U, N> Relay<S, U, N>
where
    S: Sink,
    U: StatusCheck,
    N: Notifier,
{
    pub fn new(
        config: RelayConfig,
        store: StateStore,
        sink: Arc<S>,
        upstream: Arc<U>,
        notifier: Arc<N>,
    ) -> Self {
        Self::with_shutdown(config, store, sink, upstream, notifier, CancellationToken::new())
    }

    /// Creates a relay whose background instances stop when `shutdown` is cancelled.
    pub fn with_shutdown(
        config: RelayConfig,
        store: StateStore,
        sink: Arc<S>,
        upstream: Arc<U>,
        notifier: Arc<N>,
        shutdown: CancellationToken,
    ) -> Self {
        let scheduler = Arc::new(SingletonScheduler::new_with_shutdown(
            config.start_retry,
            shutdown,
        ));
        let notifications = Notifications::new(&config, store.clone(), Arc::clone(&scheduler), notifier);
        let coordinators = Coordinators::new(
            &config,
            store.clone(),
            Arc::clone(&scheduler),
            upstream,
            notifications.clone(),
        );
        let pipeline = Pipeline::new(
            FieldFilter::new(&config.static_allowed_columns, store.clone()),
            store.clone(),
            sink,
            config.sink_timeout,
            coordinators.clone(),
            notifications,
        );

        Relay {
            store,
            scheduler,
            pipeline,
            coordinators,
        }
    }

    /// Delivers a batch. `Err(PipelineError::Retryable)` means "redeliver later".
    pub async fn deliver(
        &self,
        key: &TableKey,
        batch: Batch,
    ) -> Result<DeliveryOutcome, PipelineError> {
        self.pipeline.deliver(key, batch).await
    }

    pub fn set_allowed_columns(&self, key: &TableKey, csv: &str) -> Result<(), StoreError> {
        self.pipeline.filter().set_allowed_columns(key, csv)
    }

    pub fn get_allowed_columns(&self, key: &TableKey) -> Result<Option<String>, StoreError> {
        self.pipeline.filter().get_allowed_columns(key)
    }

    /// Collects everything the relay knows about `key`.
    pub async fn key_state(&self, key: &TableKey) -> Result<KeyState, StoreError> {
        check_table_key(key.as_str())?;
        let filter = self.pipeline.filter();
        Ok(KeyState {
            key: key.clone(),
            last_error: self.store.get(key.as_str())?,
            retry_state: self.store.get(key.as_str())?,
            coordinator_running: self
                .scheduler
                .is_running(&InstanceKey::coordinator(key))
                .await,
            client_allowed_columns: filter.get_allowed_columns(key)?,
            effective_allowed_columns: filter.resolve(key)?.map(|allow| allow.names()),
        })
    }

    /// Restarts coordinators for every key with persisted retry state.
    pub async fn resume(&self) -> Result<usize, StoreError> {
        self.coordinators.resume_all().await
    }

    /// Stops all background instances.
    pub fn shutdown(&self) {
        info!("Relay shutting down");
        self.scheduler.shutdown();
    }

    pub fn scheduler(&self) -> &SingletonScheduler {
        &self.scheduler
    }
}
