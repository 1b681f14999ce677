//! Periodic heartbeat to the gateway.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::GatewaySender;
use crate::session::Session;

/// Send a heartbeat now and then every `every` until `cancel` fires.
///
/// Failed sends are logged; a dead transport is noticed by the read loop.
pub async fn run_heartbeat(
    sender: Arc<dyn GatewaySender>,
    session: Arc<Session>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let heartbeat = session.heartbeat();
        if let Err(e) = sender.send(&heartbeat).await {
            tracing::warn!("Failed to send heartbeat: {}", e);
        }
    }

    tracing::debug!("Heartbeat stopped");
}
