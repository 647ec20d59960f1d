//! Health check endpoint for liveness probes.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,

    /// Coordinators and throttlers currently holding a scheduler slot.
    pub running_instances: usize,
}

/// Health check handler. Always 200 while the server accepts connections.
pub async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, Json<Health>) {
    let running_instances = app_state.relay().scheduler().running_count().await;
    (
        StatusCode::OK,
        Json(Health {
            status: "ok",
            running_instances,
        }),
    )
}
