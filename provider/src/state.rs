//! Shared state for the local status API.

use std::sync::Arc;

use crate::session::Session;

/// State passed to all status API handlers.
pub struct AppState {
    pub session: Arc<Session>,
}

impl AppState {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}
