//! Per-request execution.
//!
//! Every request runs on its own task: it calls the backend and relays the
//! outcome to the gateway as a `response`, a run of `stream_token` frames, or
//! an `error`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use llmhub_common::{InferenceResponse, ProviderMessage, RequestEnvelope, StreamToken};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::GatewaySender;
use crate::backend::{InferenceBackend, InferenceRequest, TokenSink};
use crate::config::AdmissionPolicy;
use crate::error::Result;
use crate::session::{InFlightGuard, Session};

const AT_CAPACITY: &str = "provider at capacity";

#[derive(Clone)]
enum Admission {
    Unbounded,
    Queue(Arc<Semaphore>),
    Reject(Arc<Semaphore>),
}

/// Runs gateway requests against the backend.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn InferenceBackend>,
    sender: Arc<dyn GatewaySender>,
    session: Arc<Session>,
    admission: Admission,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        sender: Arc<dyn GatewaySender>,
        session: Arc<Session>,
        policy: AdmissionPolicy,
    ) -> Self {
        let slots = || Arc::new(Semaphore::new(session.max_concurrent() as usize));
        let admission = match policy {
            AdmissionPolicy::Unbounded => Admission::Unbounded,
            AdmissionPolicy::Queue => Admission::Queue(slots()),
            AdmissionPolicy::Reject => Admission::Reject(slots()),
        };
        Self {
            backend,
            sender,
            session,
            admission,
        }
    }

    /// Accept a request and run it on its own task.
    ///
    /// The request counts toward the queue depth from this call until its
    /// task finishes, whatever the outcome.
    pub fn dispatch(&self, envelope: RequestEnvelope) -> JoinHandle<()> {
        let guard = self.session.begin_request();
        let this = self.clone();
        tokio::spawn(async move { this.handle(envelope, guard).await })
    }

    async fn handle(&self, envelope: RequestEnvelope, _guard: InFlightGuard) {
        let Some(_permit) = self.admit(&envelope.request_id).await else {
            return;
        };

        let request = InferenceRequest::from(&envelope);
        if envelope.params.stream {
            self.handle_stream(&envelope.request_id, &request).await;
        } else {
            self.handle_complete(&envelope.request_id, &request).await;
        }
    }

    /// `None` means the request was turned away and already answered.
    async fn admit(&self, request_id: &str) -> Option<Option<OwnedSemaphorePermit>> {
        match &self.admission {
            Admission::Unbounded => Some(None),
            Admission::Queue(slots) => match Arc::clone(slots).acquire_owned().await {
                Ok(permit) => Some(Some(permit)),
                Err(_) => {
                    self.send_error(request_id, AT_CAPACITY.to_string()).await;
                    None
                }
            },
            Admission::Reject(slots) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Some(Some(permit)),
                Err(_) => {
                    tracing::info!(request_id = %request_id, "Rejecting request, at capacity");
                    self.send_error(request_id, AT_CAPACITY.to_string()).await;
                    None
                }
            },
        }
    }

    async fn handle_complete(&self, request_id: &str, request: &InferenceRequest) {
        let started = Instant::now();

        let result = match self.backend.complete(request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(request_id = %request_id, "Inference failed: {}", e);
                self.send_error(request_id, format!("inference failed: {}", e))
                    .await;
                return;
            }
        };

        let usage = result.usage();
        let response = ProviderMessage::Response(InferenceResponse {
            request_id: request_id.to_string(),
            text: result.text,
            provider_id: self.session.provider_id().to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            usage,
        });

        match self.sender.send(&response).await {
            Ok(()) => {
                self.session.record_completed();
                tracing::debug!(
                    request_id = %request_id,
                    completion_tokens = usage.completion_tokens,
                    "Request completed"
                );
            }
            Err(e) => tracing::warn!(request_id = %request_id, "Failed to send response: {}", e),
        }
    }

    async fn handle_stream(&self, request_id: &str, request: &InferenceRequest) {
        let mut sink = GatewayTokenSink {
            sender: self.sender.as_ref(),
            request_id,
            index: 0,
        };

        let result = match self.backend.stream(request, &mut sink).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(request_id = %request_id, "Streaming failed: {}", e);
                self.send_error(request_id, format!("streaming failed: {}", e))
                    .await;
                return;
            }
        };

        let usage = result.usage();
        let terminal = StreamToken::terminal(request_id, sink.index, result.text, usage);
        match self.sender.send(&ProviderMessage::StreamToken(terminal)).await {
            Ok(()) => {
                self.session.record_completed();
                tracing::debug!(
                    request_id = %request_id,
                    tokens = sink.index,
                    "Stream completed"
                );
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, "Failed to send final token: {}", e)
            }
        }
    }

    async fn send_error(&self, request_id: &str, message: String) {
        if let Err(e) = self
            .sender
            .send(&ProviderMessage::error(request_id, message))
            .await
        {
            tracing::warn!(request_id = %request_id, "Failed to send error frame: {}", e);
        }
    }
}

/// Forwards each backend fragment as a `stream_token` frame.
struct GatewayTokenSink<'a> {
    sender: &'a dyn GatewaySender,
    request_id: &'a str,
    /// Index of the next frame.
    index: u64,
}

#[async_trait]
impl<'a> TokenSink for GatewayTokenSink<'a> {
    async fn on_token(&mut self, token: &str, _done: bool) -> Result<()> {
        let frame = StreamToken::fragment(self.request_id, token, self.index);
        self.sender.send(&ProviderMessage::StreamToken(frame)).await?;
        self.index += 1;
        Ok(())
    }
}
