use std::process::ExitCode;

use change_relay::config::RelayConfig;
use change_relay::server::{AppState, ServerConfig, build_router};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "change_relay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let server = ServerConfig::from_env()?;
    let relay_config = RelayConfig::from_env();
    let shutdown = CancellationToken::new();

    info!(
        state_dir = %server.state_dir.display(),
        outbox_dir = %server.outbox_dir.display(),
        "Opening relay"
    );
    let app_state = AppState::assemble(&server, relay_config, shutdown.clone());

    let resumed = app_state.relay().resume().await?;
    info!(resumed, "Recovered persisted retry coordinators");

    let listener = tokio::net::TcpListener::bind(server.listen_addr).await?;
    info!("listening on {}", server.listen_addr);

    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(wait_for_signal(shutdown))
        .await?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C, waiting for cancellation only");
        shutdown.cancelled().await;
        return;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
