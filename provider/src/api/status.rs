//! Provider status endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use llmhub_common::ProviderStatus;

use crate::state::AppState;

/// GET /status - snapshot of the gateway session.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<ProviderStatus> {
    Json(state.session.status())
}
