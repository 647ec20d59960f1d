//! Batch ingestion endpoint.
//!
//! Runs each posted batch through the relay synchronously. The response code
//! tells the upstream feed whether to advance its checkpoint:
//!
//! - 202: delivered, or permanently rejected and reported. Move on.
//! - 503: retryable failure. Redeliver this batch later.
//! - 400: the body is not a batch, or the key is too long to store.
//! - 500: the state store is unavailable.
//!
//! Every 503 is counted in the [`RedeliveryLedger`](crate::collaborators::RedeliveryLedger)
//! and the count is cleared by the next 202 for the key.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{AppState, store_status};
use crate::delivery::{DeliveryOutcome, PipelineError};
use crate::persistence::StoreError;
use crate::types::{Batch, ChangeRecord, Operation, TableKey};

/// One record as posted by the upstream feed. The key comes from the path.
#[derive(Debug, Deserialize)]
struct IncomingRecord {
    #[serde(default)]
    operation: Operation,
    fields: Map<String, Value>,
}

/// Errors that can occur when ingesting a batch.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The body is not a JSON array of records.
    #[error("invalid batch body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Delivery failed and the batch must be redelivered.
    #[error("{0}")]
    Retryable(PipelineError),

    /// The state store failed or cannot hold the key.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl From<PipelineError> for IngestError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Store(e) => IngestError::Store(e),
            retryable => IngestError::Retryable(retryable),
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            IngestError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
            IngestError::Store(e) => store_status(e),
        };
        (status, self.to_string()).into_response()
    }
}

/// Ingestion handler.
///
/// # Example
///
/// ```ignore
/// POST /api/v1/tables/dbo.Orders/batches HTTP/1.1
/// Content-Type: application/json
///
/// [{"operation": "update", "fields": {"Id": 7, "Total": 12.5}}]
///
/// HTTP/1.1 202 Accepted
///
/// {"outcome": "delivered", "records": 1}
/// ```
pub async fn ingest_handler(
    State(app_state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<DeliveryOutcome>), IngestError> {
    let key = TableKey::new(key);
    let batch = parse_batch(&key, &body)?;

    debug!(key = %key, records = batch.len(), "Received batch");

    match app_state.relay().deliver(&key, batch).await {
        Ok(outcome) => {
            app_state.ledger().record_success(&key)?;
            info!(key = %key, ?outcome, "Batch accepted");
            Ok((StatusCode::ACCEPTED, Json(outcome)))
        }
        Err(PipelineError::Store(e)) => {
            warn!(key = %key, error = %e, "State store failed during delivery");
            Err(IngestError::Store(e))
        }
        Err(retryable) => {
            let outstanding = app_state.ledger().record_failure(&key)?;
            warn!(key = %key, outstanding, error = %retryable, "Batch refused, redelivery required");
            Err(retryable.into())
        }
    }
}

fn parse_batch(key: &TableKey, body: &[u8]) -> Result<Batch, IngestError> {
    let records: Vec<IncomingRecord> = serde_json::from_slice(body)?;
    Ok(records
        .into_iter()
        .map(|record| ChangeRecord::new(key.clone(), record.operation, record.fields))
        .collect())
}
