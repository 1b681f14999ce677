//! Local status HTTP API.
//!
//! Optional. Lets local tooling and supervisors see whether the provider is
//! up and how busy it is, without going through the hub.

pub mod health;
pub mod status;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::StatusApiConfig;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::state::AppState;

/// Build the status router.
pub fn router(session: Arc<Session>) -> Router {
    let state = Arc::new(AppState::new(session));
    Router::new()
        .route("/health", get(health::health))
        .route("/status", get(status::status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status API until `cancel` fires.
pub async fn serve(
    config: &StatusApiConfig,
    session: Arc<Session>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        Error::Configuration(format!("failed to bind status API on {}: {}", addr, e))
    })?;
    tracing::info!("Status API listening on {}", addr);

    axum::serve(listener, router(session))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Transport(format!("status API failed: {}", e)))
}
