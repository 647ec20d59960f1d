//! State inspection endpoint for observability.
//!
//! Provides a read-only view of a key's relay state for debugging and
//! monitoring: last error, retry progress and allow-lists.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};

use super::{AppState, store_status};
use crate::persistence::StoreError;
use crate::relay::KeyState;
use crate::types::TableKey;

/// Store failures while reading state.
#[derive(Debug)]
pub struct StateError(StoreError);

impl IntoResponse for StateError {
    fn into_response(self) -> Response {
        (store_status(&self.0), self.0.to_string()).into_response()
    }
}

/// State inspection handler.
///
/// # Response
///
/// - 200 OK with JSON body containing [`KeyState`] (unknown keys report an
///   empty state)
/// - 400 Bad Request if the key is too long to store
/// - 500 Internal Server Error if the state store cannot be read
///
/// # Example
///
/// ```ignore
/// GET /api/v1/tables/dbo.Orders/state HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// {
///   "key": "dbo.Orders",
///   "last_error": {"message": "delivery failed: connection reset", ...},
///   "retry_state": {"attempt": 3, ...},
///   ...
/// }
/// ```
pub async fn state_handler(
    State(app_state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<KeyState>, StateError> {
    let key = TableKey::new(key);
    app_state
        .relay()
        .key_state(&key)
        .await
        .map(Json)
        .map_err(StateError)
}
