//! Thin HTTP adapter over the orchestrator.

pub mod models;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

use axum::middleware;
use tokio::signal;
use tracing::info;

use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;
use crate::{Error, Result};

pub use models::{ApiError, SubmitRequest, SubmitResponse};
pub use routes::{create_router, USER_HEADER};
pub use state::AppState;

/// Router with request logging, ready to serve or to drive in tests.
pub fn app(orchestrator: Orchestrator) -> axum::Router {
    create_router(AppState::new(orchestrator)).layer(middleware::from_fn(routes::request_logger))
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn serve(orchestrator: Orchestrator, config: &ServerConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Validation(format!("invalid server address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app(orchestrator))
        .with_graceful_shutdown(async {
            tokio::select! {
                _ = signal::ctrl_c() => info!("Received Ctrl+C signal"),
                _ = wait_for_sigterm() => info!("Received SIGTERM signal"),
            }
            info!("Starting graceful shutdown...");
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
