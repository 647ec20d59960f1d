//! Allow-list override endpoints.
//!
//! The body is plain text: a comma-separated list of column names. An empty
//! body clears the override.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::info;

use super::{AppState, store_status};
use crate::persistence::StoreError;
use crate::types::TableKey;

/// Errors from the allow-list endpoints.
#[derive(Debug, Error)]
pub enum ColumnsError {
    #[error("no allow-list override set for {0}")]
    NotFound(TableKey),

    #[error("column list is not valid UTF-8")]
    InvalidBody(#[from] std::str::Utf8Error),

    #[error("state store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ColumnsError {
    fn into_response(self) -> Response {
        let status = match &self {
            ColumnsError::NotFound(_) => StatusCode::NOT_FOUND,
            ColumnsError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ColumnsError::Store(e) => store_status(e),
        };
        (status, self.to_string()).into_response()
    }
}

/// `PUT /api/v1/tables/{key}/allowed-columns`. Returns 204.
pub async fn put_columns_handler(
    State(app_state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ColumnsError> {
    let key = TableKey::new(key);
    let csv = std::str::from_utf8(&body)?;
    app_state.relay().set_allowed_columns(&key, csv)?;
    info!(key = %key, columns = %csv.trim(), "Allow-list override updated");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/tables/{key}/allowed-columns`. Returns the list or 404.
pub async fn get_columns_handler(
    State(app_state): State<AppState>,
    Path(key): Path<String>,
) -> Result<String, ColumnsError> {
    let key = TableKey::new(key);
    app_state
        .relay()
        .get_allowed_columns(&key)?
        .ok_or(ColumnsError::NotFound(key))
}
