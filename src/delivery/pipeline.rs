//! Filter, send, classify, branch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::error::{DeliveryError, FailureClass, classify};
use crate::collaborators::{Notifier, Sink, StatusCheck};
use crate::coordinator::Coordinators;
use crate::filter::FieldFilter;
use crate::persistence::{LastErrorRecord, StateStore, StoreError, check_table_key};
use crate::throttler::Notifications;
use crate::types::{Batch, NotifyReason, TableKey};

/// Errors returned to the ingestion layer.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Delivery failed and will be retried; the batch must be redelivered.
    #[error("retryable delivery failure for {key}: {source}")]
    Retryable {
        key: TableKey,
        #[source]
        source: DeliveryError,
    },

    /// The state store failed. Nothing can proceed without it.
    #[error("state store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// A batch the pipeline is done with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The sink accepted the batch.
    Delivered { records: usize },

    /// The sink permanently rejected the batch. An operator notification was
    /// scheduled and the batch is dropped.
    Handled { error: String },
}

/// The per-batch delivery path.
pub struct Pipeline<S, U, N> {
    filter: FieldFilter,
    store: StateStore,
    sink: Arc<S>,
    sink_timeout: Duration,
    coordinators: Coordinators<U, N>,
    notifications: Notifications<N>,
}

impl<S, U, N> Pipeline<S, U, N>
where
    S: Sink,
    U: StatusCheck,
    N: Notifier,
{
    pub fn new(
        filter: FieldFilter,
        store: StateStore,
        sink: Arc<S>,
        sink_timeout: Duration,
        coordinators: Coordinators<U, N>,
        notifications: Notifications<N>,
    ) -> Self {
        Pipeline {
            filter,
            store,
            sink,
            sink_timeout,
            coordinators,
            notifications,
        }
    }

    pub fn filter(&self) -> &FieldFilter {
        &self.filter
    }

    /// Delivers one batch for `key`.
    ///
    /// The last-error record is written before any scheduling decision.
    #[instrument(skip(self, batch), fields(key = %key, records = batch.len()))]
    pub async fn deliver(&self, key: &TableKey, mut batch: Batch) -> Result<DeliveryOutcome> {
        check_table_key(key.as_str())?;
        self.filter.filter(key, &mut batch)?;

        let sent = match tokio::time::timeout(self.sink_timeout, self.sink.send(key, &batch)).await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::timed_out(self.sink_timeout)),
        };

        let error = match sent {
            Ok(()) => {
                debug!("Batch delivered");
                return Ok(DeliveryOutcome::Delivered {
                    records: batch.len(),
                });
            }
            Err(error) => error,
        };

        let class = classify(&error);
        self.store.put(
            key.as_str(),
            &LastErrorRecord::new(error.to_string(), Utc::now()),
        )?;

        match class {
            FailureClass::Retryable => {
                warn!(error = %error, "Delivery failed, scheduling retry coordination");
                let outcome = self.coordinators.ensure(key).await;
                debug!(?outcome, "Coordinator ensured");
                Err(PipelineError::Retryable {
                    key: key.clone(),
                    source: error,
                })
            }
            FailureClass::NonRetryable => {
                warn!(error = %error, "Delivery permanently rejected, notifying");
                let outcome = self
                    .notifications
                    .ensure(key, NotifyReason::NonRetryable, error.message.clone())
                    .await;
                debug!(?outcome, "Throttler ensured");
                Ok(DeliveryOutcome::Handled {
                    error: error.to_string(),
                })
            }
        }
    }
}
