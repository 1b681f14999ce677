//! WebSocket connection to the gateway.

use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use llmhub_common::{
    GatewayMessage, ProviderMessage, Registration, RequestEnvelope, PROVIDER_WS_PATH,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, GatewaySender};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Read half of an established gateway connection.
pub type GatewayReader = SplitStream<WsStream>;

/// Everything needed to open and register a gateway connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub hub_url: String,
    pub registration: Registration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
}

/// Map a hub URL onto the provider WebSocket endpoint.
///
/// `http` becomes `ws`, `https` becomes `wss`, `ws`/`wss` are kept and any
/// other scheme falls back to `ws`. The path is replaced by the provider
/// endpoint; userinfo, port and query are kept.
pub fn gateway_ws_url(hub_url: &str) -> Result<String> {
    let invalid =
        |reason: String| Error::Configuration(format!("invalid hub URL {:?}: {}", hub_url, reason));

    let parsed = reqwest::Url::parse(hub_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match parsed.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };

    // `set_scheme` refuses to move between special and non-special schemes,
    // so swap the prefix and parse again.
    let rest = &parsed.as_str()[parsed.scheme().len()..];
    let mut url = reqwest::Url::parse(&format!("{}{}", scheme, rest))
        .map_err(|e| invalid(e.to_string()))?;
    if url.host_str().is_none() {
        return Err(invalid("no host".to_string()));
    }

    url.set_path(PROVIDER_WS_PATH);
    url.set_fragment(None);
    Ok(url.into())
}

/// `url` with userinfo stripped, for logs and error messages.
fn without_credentials(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(None);
            let _ = parsed.set_username("");
            parsed.into()
        }
        Err(_) => url.to_string(),
    }
}

/// Dial the gateway, register, and wait for the verdict.
///
/// On any failure the transport is closed before returning, so no half-open
/// connection outlives the call.
pub async fn connect(options: ConnectOptions) -> Result<(GatewayConnection, GatewayReader)> {
    let url = gateway_ws_url(&options.hub_url)?;
    let connection = GatewayConnection::new(options.write_timeout);

    let shown = without_credentials(&url);

    connection.transition(ConnectionState::Connecting);
    tracing::info!("Connecting to gateway at {}", shown);
    let dialed = match timeout(options.handshake_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(Error::Transport(format!("failed to connect to {}: {}", shown, e))),
        Err(_) => Err(Error::Transport(format!("timed out connecting to {}", shown))),
    };
    let ws = match dialed {
        Ok(ws) => ws,
        Err(e) => {
            connection.transition(ConnectionState::Closed);
            return Err(e);
        }
    };

    let (writer, mut reader) = ws.split();
    connection.attach(writer).await;

    let provider_id = options.registration.provider_id.clone();
    if let Err(e) = connection
        .send(&ProviderMessage::Register(options.registration))
        .await
    {
        connection.close().await;
        return Err(e);
    }
    connection.transition(ConnectionState::Registering);

    match await_registration(&mut reader, options.handshake_timeout).await {
        Ok(()) => {
            connection.transition(ConnectionState::Active);
            tracing::info!(provider_id = %provider_id, "Registered with gateway");
            Ok((connection, reader))
        }
        Err(e) => {
            connection.close().await;
            Err(e)
        }
    }
}

async fn await_registration<S>(reader: &mut S, deadline: Duration) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    let text = timeout(deadline, next_text(reader))
        .await
        .map_err(|_| Error::Handshake("timed out waiting for registration reply".to_string()))??;

    match GatewayMessage::decode(&text) {
        Ok(GatewayMessage::Registered) => Ok(()),
        Ok(GatewayMessage::Error { message }) => {
            Err(Error::Handshake(format!("registration rejected: {}", message)))
        }
        Ok(other) => Err(Error::Handshake(format!(
            "unexpected reply to registration: {:?}",
            other
        ))),
        Err(e) => Err(Error::Handshake(format!("invalid registration reply: {}", e))),
    }
}

/// Next text payload, skipping control frames.
async fn next_text<S>(reader: &mut S) -> Result<String>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Binary(data))) => {
                return String::from_utf8(data).map_err(|_| {
                    Error::Handshake("registration reply is not valid UTF-8".to_string())
                })
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Handshake(
                    "connection closed during registration".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Write half of the gateway connection.
///
/// Every outbound frame goes through one lock, so frames from the heartbeat
/// and from concurrent requests never interleave.
pub struct GatewayConnection {
    writer: Mutex<Option<WsWriter>>,
    write_timeout: Duration,
    state: SyncMutex<ConnectionState>,
}

impl GatewayConnection {
    fn new(write_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(None),
            write_timeout,
            state: SyncMutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    fn transition(&self, next: ConnectionState) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.can_transition_to(next) {
            tracing::debug!("Gateway connection {} -> {}", *state, next);
            *state = next;
        } else {
            tracing::warn!("Ignoring gateway connection transition {} -> {}", *state, next);
        }
    }

    async fn attach(&self, writer: WsWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Send a close frame and mark the connection closed. Errors are ignored.
    pub async fn close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.transition(ConnectionState::Closed);
        if let Some(writer) = self.writer.lock().await.as_mut() {
            let _ = timeout(self.write_timeout, writer.close()).await;
        }
    }
}

#[async_trait]
impl GatewaySender for GatewayConnection {
    async fn send(&self, message: &ProviderMessage) -> Result<()> {
        let json = serde_json::to_string(message).map_err(|e| {
            Error::Transport(format!("failed to encode {} frame: {}", message.kind(), e))
        })?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            Error::Transport(format!("cannot send {} frame: not connected", message.kind()))
        })?;
        timeout(self.write_timeout, writer.send(Message::Text(json)))
            .await
            .map_err(|_| {
                Error::Transport(format!("timed out writing {} frame", message.kind()))
            })??;

        tracing::trace!("Sent {} frame", message.kind());
        Ok(())
    }
}

/// Read frames until cancellation or transport loss.
///
/// Returns `Ok(())` when `cancel` fires and an error when the transport fails
/// or the gateway closes the connection. Request frames are handed to
/// `on_request` in arrival order; everything else is logged and dropped.
pub async fn run_read_loop<S, F>(
    reader: &mut S,
    cancel: &CancellationToken,
    mut on_request: F,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    F: FnMut(RequestEnvelope),
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_frame(&text, &mut on_request),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => handle_frame(text, &mut on_request),
                Err(_) => tracing::debug!("Dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Transport("gateway closed the connection".to_string()))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn handle_frame<F>(text: &str, on_request: &mut F)
where
    F: FnMut(RequestEnvelope),
{
    match GatewayMessage::decode(text) {
        Ok(GatewayMessage::Request(envelope)) => {
            tracing::debug!(request_id = %envelope.request_id, "Received request");
            on_request(envelope);
        }
        Ok(GatewayMessage::Ping) => tracing::trace!("Received ping"),
        Ok(GatewayMessage::Error { message }) => tracing::warn!("Gateway error: {}", message),
        Ok(GatewayMessage::Registered) => {
            tracing::debug!("Ignoring repeated registered frame")
        }
        Ok(GatewayMessage::Other(kind)) => tracing::debug!("Ignoring {} frame", kind),
        Err(e) => tracing::debug!("Dropping malformed frame: {}", e),
    }
}
