//! HTTP API server.
//!
//! A small administrative surface next to the connections: health, the
//! serial ports a board could be plugged into, and the state of every
//! deployed connection. Built on Axum, served under `/api/v1`.

pub mod v1;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::supervisor::SupervisorHandle;
use crate::tracing::prelude::*;

pub use v1::AppState;

/// Build the complete application router.
pub fn router(supervisor: SupervisorHandle) -> Router {
    Router::new()
        .nest("/api/v1", v1::routes(AppState::new(supervisor)))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    listen: &str,
    supervisor: SupervisorHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "API listening.");

    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    debug!("API stopped.");
    Ok(())
}
