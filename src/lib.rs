//! Flakewatch -- flaky-test detection and aggregation for CI test results.
//!
//! Run records from CI are validated and appended atomically to a per-test
//! history, each touched test is reclassified over a sliding window, and
//! aggregate queries (flake rate, slowest tests, trends, merge gates) are
//! served from maintained daily rollups.

pub mod api;
pub mod classify;
pub mod config;
pub mod engine;
pub mod identity;
pub mod ingest;
pub mod query;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::FlakewatchConfig;
use crate::engine::Flakewatch;

/// Start the Flakewatch daemon: API server and retention loop.
pub async fn serve(config: FlakewatchConfig) -> Result<()> {
    let bind = config.server.bind.clone();
    let app = Arc::new(Flakewatch::open(config).await?);

    let cancel = CancellationToken::new();
    let retention = tokio::spawn(engine::run_retention_loop(Arc::clone(&app), cancel.clone()));

    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let router = api::router(api::state::AppState::new(app))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    tracing::info!(%addr, "Flakewatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    retention.await.context("retention loop panicked")?;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
        _ = cancel.cancelled() => {}
    }
}
