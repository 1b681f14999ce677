//! Gateway side of the provider.
//!
//! This module owns the WebSocket connection to the hub: registration,
//! the inbound read loop, per-request dispatch and the heartbeat.

mod connection;
mod dispatcher;
mod heartbeat;
mod state;

pub use connection::{
    connect, gateway_ws_url, run_read_loop, ConnectOptions, GatewayConnection, GatewayReader,
};
pub use dispatcher::Dispatcher;
pub use heartbeat::run_heartbeat;
pub use state::ConnectionState;

use async_trait::async_trait;
use llmhub_common::ProviderMessage;

use crate::error::Result;

/// Outbound half of the gateway connection.
///
/// Implementations must serialize concurrent sends so frames never
/// interleave on the wire.
#[async_trait]
pub trait GatewaySender: Send + Sync {
    async fn send(&self, message: &ProviderMessage) -> Result<()>;
}
