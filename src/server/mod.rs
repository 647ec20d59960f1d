//! HTTP server for the change relay.
//!
//! This module implements the HTTP surface that:
//! - Accepts change batches from the upstream feed and runs them through the relay
//! - Lets clients manage per-key allow-list overrides
//! - Provides state inspection endpoints for observability
//! - Provides health checks for liveness probes
//!
//! # Endpoints
//!
//! - `POST /api/v1/tables/{key}/batches` - Delivers a batch (202, or 503 to request redelivery)
//! - `PUT /api/v1/tables/{key}/allowed-columns` - Replaces the client allow-list
//! - `GET /api/v1/tables/{key}/allowed-columns` - Returns the client allow-list
//! - `GET /api/v1/tables/{key}/state` - Returns the key's diagnostic state as JSON
//! - `GET /health` - Returns 200 if server is running

use std::sync::Arc;

use axum::http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{LogNotifier, OutboxSink, RedeliveryLedger};
use crate::config::RelayConfig;
use crate::persistence::{StateStore, StoreError};
use crate::relay::Relay;

pub mod columns;
pub mod config;
pub mod health;
pub mod ingest;
pub mod state;

pub use columns::{get_columns_handler, put_columns_handler};
pub use config::{ConfigError, ServerConfig};
pub use health::health_handler;
pub use ingest::ingest_handler;
pub use state::state_handler;

/// The relay as assembled by the binary.
pub type ServerRelay = Relay<OutboxSink, RedeliveryLedger, LogNotifier>;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    relay: ServerRelay,

    /// Counts batches answered with 503, per key. Also the relay's upstream
    /// status collaborator.
    ledger: RedeliveryLedger,
}

impl AppState {
    pub fn new(relay: ServerRelay, ledger: RedeliveryLedger) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { relay, ledger }),
        }
    }

    /// Builds the binary's relay: file store, outbox sink, redelivery
    /// ledger and log notifier.
    pub fn assemble(
        server: &ServerConfig,
        relay_config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let store = StateStore::open(&server.state_dir);
        let ledger = RedeliveryLedger::new(store.clone(), server.max_redeliveries);
        let relay = Relay::with_shutdown(
            relay_config,
            store,
            Arc::new(OutboxSink::new(&server.outbox_dir)),
            Arc::new(ledger.clone()),
            Arc::new(LogNotifier),
            shutdown,
        );
        Self::new(relay, ledger)
    }

    pub fn relay(&self) -> &ServerRelay {
        &self.inner.relay
    }

    pub fn ledger(&self) -> &RedeliveryLedger {
        &self.inner.ledger
    }
}

/// Status for a store error raised while handling a request. A key the store
/// cannot hold is the client's fault.
fn store_status(error: &StoreError) -> StatusCode {
    if error.is_invalid_key() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/v1/tables/{key}/batches", post(ingest_handler))
        .route(
            "/api/v1/tables/{key}/allowed-columns",
            get(get_columns_handler).put(put_columns_handler),
        )
        .route("/api/v1/tables/{key}/state", get(state_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
