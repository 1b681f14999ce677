//! Inference backend abstraction layer.
//!
//! This module defines the `InferenceBackend` trait that normalizes the
//! supported local inference servers (Ollama, llama.cpp, vLLM and a generic
//! JSON endpoint) behind one contract: complete, stream, health.

mod custom;
pub(crate) mod lines;
mod llama_cpp;
mod ollama;
mod vllm;

pub use custom::CustomBackend;
pub use llama_cpp::LlamaCppBackend;
pub use ollama::OllamaBackend;
pub use vllm::VllmBackend;

use std::time::Duration;

use async_trait::async_trait;
use llmhub_common::{RequestEnvelope, Usage};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};

/// Generation can take minutes on slow hardware.
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Inference request as seen by a backend.
///
/// Zero values mean "use the server default" and are left out of the
/// backend request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl From<&RequestEnvelope> for InferenceRequest {
    fn from(envelope: &RequestEnvelope) -> Self {
        Self {
            prompt: envelope.prompt.clone(),
            max_tokens: envelope.params.max_tokens,
            temperature: envelope.params.temperature,
            top_p: envelope.params.top_p,
        }
    }
}

impl InferenceRequest {
    pub(crate) fn max_tokens_opt(&self) -> Option<u32> {
        (self.max_tokens > 0).then_some(self.max_tokens)
    }

    pub(crate) fn temperature_opt(&self) -> Option<f64> {
        (self.temperature != 0.0).then_some(self.temperature)
    }

    pub(crate) fn top_p_opt(&self) -> Option<f64> {
        (self.top_p != 0.0).then_some(self.top_p)
    }
}

/// Result of a completed generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceResult {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl InferenceResult {
    pub fn usage(&self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }
}

/// Receives streamed fragments in arrival order.
///
/// Returning an error aborts the stream; the backend call then fails with
/// that same error.
#[async_trait]
pub trait TokenSink: Send {
    async fn on_token(&mut self, token: &str, done: bool) -> Result<()>;
}

/// Primary trait for inference backends.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Which kind of server this is.
    fn kind(&self) -> BackendKind;

    /// Run a prompt to completion in a single call.
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResult>;

    /// Run a prompt, pushing fragments to `sink` as they arrive.
    async fn stream(
        &self,
        request: &InferenceRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<InferenceResult>;

    /// Check that the server is reachable and able to serve.
    async fn health(&self) -> Result<()>;
}

/// The configured backend, one of a fixed set of variants.
pub enum Backend {
    Ollama(OllamaBackend),
    LlamaCpp(LlamaCppBackend),
    Vllm(VllmBackend),
    Custom(CustomBackend),
}

impl Backend {
    /// Build the backend selected by `config` for `model`.
    pub fn from_config(config: &BackendConfig, model: &str) -> Result<Self> {
        let url = config.url.as_deref();
        let api_key = config.api_key.clone();
        let backend = match config.kind {
            BackendKind::Ollama => Backend::Ollama(OllamaBackend::new(url, model)?),
            BackendKind::LlamaCpp => Backend::LlamaCpp(LlamaCppBackend::new(url)?),
            BackendKind::Vllm => Backend::Vllm(VllmBackend::new(url, model, api_key)?),
            BackendKind::Custom => Backend::Custom(CustomBackend::new(url, api_key)?),
        };
        Ok(backend)
    }

    fn inner(&self) -> &dyn InferenceBackend {
        match self {
            Backend::Ollama(b) => b,
            Backend::LlamaCpp(b) => b,
            Backend::Vllm(b) => b,
            Backend::Custom(b) => b,
        }
    }
}

#[async_trait]
impl InferenceBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        self.inner().complete(request).await
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<InferenceResult> {
        self.inner().stream(request, sink).await
    }

    async fn health(&self) -> Result<()> {
        self.inner().health().await
    }
}

// ============================================================================
// Shared HTTP helpers
// ============================================================================

pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(BACKEND_TIMEOUT)
        .build()
        .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))
}

pub(crate) fn normalize_url(url: Option<&str>, default: &str) -> String {
    url.filter(|u| !u.is_empty())
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

pub(crate) fn unavailable(kind: BackendKind, e: reqwest::Error) -> Error {
    Error::BackendUnavailable {
        backend: kind.as_str(),
        message: e.to_string(),
    }
}

/// Pass successful responses through; turn anything else into `Error::Backend`.
pub(crate) async fn check_status(kind: BackendKind, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Backend {
        backend: kind.as_str(),
        status: status.as_u16(),
        body,
    })
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    kind: BackendKind,
    response: Response,
) -> Result<T> {
    let bytes = response.bytes().await.map_err(|e| unavailable(kind, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::BackendProtocol {
        backend: kind.as_str(),
        message: e.to_string(),
    })
}
