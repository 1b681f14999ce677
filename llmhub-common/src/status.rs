//! Provider status snapshot served by the local status API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of a running provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub model: String,
    pub backend: String,
    /// "online" while the gateway session is active.
    pub status: String,
    pub uptime_seconds: u64,
    /// Requests relayed successfully since startup.
    pub request_count: u64,
    /// Requests currently in flight.
    pub queue_depth: u32,
    pub max_concurrent: u32,
    pub gpu_util: f64,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
