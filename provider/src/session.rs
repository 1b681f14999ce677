//! Per-connection provider session.
//!
//! Holds the identity advertised to the gateway and the live counters the
//! heartbeat and status API report. Counters sit behind a plain mutex that is
//! never held across an await point.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use llmhub_common::{Heartbeat, ProviderMessage, ProviderStatus, Registration};

use crate::config::{BackendKind, Config};

#[derive(Debug, Default)]
struct Counters {
    queue_depth: u32,
    request_count: u64,
}

pub struct Session {
    provider_id: String,
    model: String,
    backend: BackendKind,
    max_concurrent: u32,
    started: Instant,
    started_at: DateTime<Utc>,
    counters: Mutex<Counters>,
}

/// Short random id: the first eight characters of a v4 UUID.
pub fn generate_provider_id() -> String {
    let mut id = uuid::Uuid::new_v4().to_string();
    id.truncate(8);
    id
}

impl Session {
    pub fn new(
        provider_id: String,
        model: String,
        backend: BackendKind,
        max_concurrent: u32,
    ) -> Self {
        Self {
            provider_id,
            model,
            backend,
            max_concurrent: max_concurrent.max(1),
            started: Instant::now(),
            started_at: Utc::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn from_config(provider_id: String, config: &Config) -> Self {
        Self::new(
            provider_id,
            config.provider.model.clone(),
            config.backend.kind,
            config.provider.effective_max_concurrent(),
        )
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent
    }

    /// Register frame payload for this session.
    pub fn registration(&self, description: &str, token: &str) -> Registration {
        Registration {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            backend: self.backend.as_str().to_string(),
            price: 0.0,
            description: description.to_string(),
            max_concurrent: self.max_concurrent,
            token: token.to_string(),
        }
    }

    /// Count a request as in flight until the returned guard is dropped.
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.with_counters(|c| c.queue_depth += 1);
        InFlightGuard {
            session: Arc::clone(self),
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.with_counters(|c| c.queue_depth)
    }

    pub fn request_count(&self) -> u64 {
        self.with_counters(|c| c.request_count)
    }

    pub fn record_completed(&self) {
        self.with_counters(|c| c.request_count += 1);
    }

    pub fn heartbeat(&self) -> ProviderMessage {
        ProviderMessage::Heartbeat(Heartbeat {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            queue_depth: self.queue_depth(),
            gpu_util: 0.0,
        })
    }

    pub fn status(&self) -> ProviderStatus {
        let (queue_depth, request_count) = self.with_counters(|c| (c.queue_depth, c.request_count));
        ProviderStatus {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            backend: self.backend.as_str().to_string(),
            status: "online".to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            request_count,
            queue_depth,
            max_concurrent: self.max_concurrent,
            gpu_util: 0.0,
            started_at: self.started_at,
            timestamp: Utc::now(),
        }
    }

    fn with_counters<T>(&self, f: impl FnOnce(&mut Counters) -> T) -> T {
        // Plain integers: still consistent after a poisoning panic.
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut counters)
    }
}

/// Decrements the queue depth when dropped.
pub struct InFlightGuard {
    session: Arc<Session>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.session
            .with_counters(|c| c.queue_depth = c.queue_depth.saturating_sub(1));
    }
}
