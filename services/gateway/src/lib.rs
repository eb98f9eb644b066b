//! Gateway
//!
//! HTTP and websocket surface of the telemetry backend: bearer
//! authentication against the identity service, per-user rate limits, the
//! REST routes over the reconciled device state, and the realtime channel.
//! [`run`] wires the ledger and identity clients, starts the reconciliation
//! poller and serves until a shutdown signal arrives.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod rate_limit;
pub mod router;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use telemetry::identity::HttpIdentity;
use telemetry::ledger::HttpLedger;
use telemetry::pipeline::spawn_poller;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use config::Config;
use router::create_router;
use state::AppState;

/// Structured logging, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let ledger = HttpLedger::new(config.ledger.clone()).context("ledger client")?;
    let identity =
        HttpIdentity::new(config.identity_url.clone(), config.ledger.timeout).context("identity client")?;

    info!(
        ledger = %config.ledger.base_url,
        identity = %config.identity_url,
        temperature = %config.collections.temperature,
        alerts = %config.collections.alerts,
        "Initializing state"
    );
    let state = AppState::new(Arc::new(ledger), Arc::new(identity), &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = spawn_poller(state.pipeline.clone(), config.poller.clone(), shutdown_rx);

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        error!(error = %e, "Poller task failed");
    }
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
