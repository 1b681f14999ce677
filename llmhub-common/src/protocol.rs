//! WebSocket protocol types for provider-gateway communication.
//!
//! The protocol uses JSON-encoded text frames over WebSocket. Each frame is a
//! single JSON object whose `type` field determines its structure.
//!
//! ## Connection Flow
//!
//! 1. Provider connects to `<hub>/provider/ws`
//! 2. Provider sends `register` with its identity and auth token
//! 3. Gateway responds with `registered` on success or `error` on failure
//! 4. Provider sends a `heartbeat` immediately and then periodically
//! 5. Gateway forwards `request` frames; the provider answers each one with
//!    either a `response`, a sequence of `stream_token` frames, or an `error`
//!
//! ## Pings
//!
//! The gateway may send application-level `ping` frames. They carry no
//! payload and need no answer; transport keepalive is handled by WebSocket
//! ping/pong.

use serde::{Deserialize, Serialize};

use crate::Usage;

/// Path of the provider WebSocket endpoint on the gateway.
pub const PROVIDER_WS_PATH: &str = "/provider/ws";

/// Frames sent from provider to gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderMessage {
    /// First frame on a new connection.
    Register(Registration),
    /// Periodic load report.
    Heartbeat(Heartbeat),
    /// Complete result of a non-streaming request.
    Response(InferenceResponse),
    /// One fragment of a streaming request.
    StreamToken(StreamToken),
    /// Failure of a single request.
    Error(RequestError),
}

/// Registration data sent on connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub provider_id: String,
    pub model: String,
    /// Backend type name (e.g. "ollama", "vllm").
    pub backend: String,
    /// Price per request. Always zero for now.
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub description: String,
    pub max_concurrent: u32,
    /// Provider token issued by the hub dashboard.
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub provider_id: String,
    pub model: String,
    pub queue_depth: u32,
    #[serde(default)]
    pub gpu_util: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: String,
    pub text: String,
    pub provider_id: String,
    pub latency_ms: u64,
    pub usage: Usage,
}

/// A streamed fragment.
///
/// Only the terminal token (`done == true`) carries `text` and `usage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamToken {
    pub request_id: String,
    pub token: String,
    pub index: u64,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamToken {
    /// In-flight fragment.
    pub fn fragment(request_id: &str, token: &str, index: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            token: token.to_string(),
            index,
            done: false,
            text: None,
            usage: None,
        }
    }

    /// Terminal summary token carrying the full text and usage.
    pub fn terminal(request_id: &str, index: u64, text: String, usage: Usage) -> Self {
        Self {
            request_id: request_id.to_string(),
            token: String::new(),
            index,
            done: true,
            text: (!text.is_empty()).then_some(text),
            usage: Some(usage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub request_id: String,
    pub message: String,
}

impl ProviderMessage {
    pub fn error(request_id: &str, message: impl Into<String>) -> Self {
        ProviderMessage::Error(RequestError {
            request_id: request_id.to_string(),
            message: message.into(),
        })
    }

    /// Wire name of this frame's type.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderMessage::Register(_) => "register",
            ProviderMessage::Heartbeat(_) => "heartbeat",
            ProviderMessage::Response(_) => "response",
            ProviderMessage::StreamToken(_) => "stream_token",
            ProviderMessage::Error(_) => "error",
        }
    }
}

/// Inference request forwarded by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub params: InferenceParams,
}

/// Sampling parameters. Zero values mean "use the backend default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub top_p: f64,
    #[serde(default)]
    pub stream: bool,
}

/// Frames sent from gateway to provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Handshake success.
    Registered,
    /// Handshake failure or gateway-side problem.
    Error { message: String },
    /// Inference request to execute.
    Request(RequestEnvelope),
    /// Application-level keepalive; needs no answer.
    Ping,
    /// Any type this provider does not understand.
    #[serde(skip)]
    Other(String),
}

/// Just enough structure to read the type tag.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl GatewayMessage {
    /// Decode an inbound frame.
    ///
    /// The type tag is read first; the rest of the frame is only decoded for
    /// types that carry a payload. Unknown types decode to [`GatewayMessage::Other`].
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "registered" => Ok(GatewayMessage::Registered),
            "ping" => Ok(GatewayMessage::Ping),
            "error" => {
                let body: ErrorBody = serde_json::from_str(text)?;
                Ok(GatewayMessage::Error {
                    message: body.message,
                })
            }
            "request" => Ok(GatewayMessage::Request(serde_json::from_str(text)?)),
            _ => Ok(GatewayMessage::Other(envelope.kind)),
        }
    }
}
