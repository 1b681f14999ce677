//! Client for the gateway's consumer REST API.
//!
//! Backs the `status`, `models`, `ask` and `chat` commands.

use std::time::Duration;

use llmhub_common::chat::ApiErrorResponse;
use llmhub_common::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelEntry, ModelList,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::backend::lines::{sse_data, LineReader};
use crate::error::{Error, Result};

const CONSUMER_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const DONE_SENTINEL: &str = "[DONE]";
const ERROR_PREFIX: &str = "[ERROR]";

/// Outcome of a hub health probe that got an HTTP answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubHealth {
    Healthy,
    Unhealthy(u16),
}

/// Sampling options for [`ConsumerClient::ask`] and [`ConsumerClient::stream`].
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

pub struct ConsumerClient {
    http_client: Client,
    hub_url: String,
}

impl ConsumerClient {
    pub fn new(hub_url: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(CONSUMER_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            hub_url: hub_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }

    /// Probe `GET /health`. Only an unreachable hub is an error.
    pub async fn health(&self) -> Result<HubHealth> {
        let response = self
            .http_client
            .get(format!("{}/health", self.hub_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("cannot reach hub: {}", e)))?;

        Ok(match response.status() {
            StatusCode::OK => HubHealth::Healthy,
            status => HubHealth::Unhealthy(status.as_u16()),
        })
    }

    pub async fn list_models(&self) -> Result<Vec<ModelEntry>> {
        let response = self
            .http_client
            .get(format!("{}/v1/models", self.hub_url))
            .send()
            .await
            .map_err(request_failed)?;
        let list: ModelList = decode(ok_or_api_error(response).await?).await?;
        Ok(list.data)
    }

    /// Non-streaming chat completion; returns the first choice's content.
    pub async fn ask(&self, model: &str, prompt: &str, options: &AskOptions) -> Result<String> {
        let request = chat_request(model, prompt, options, false);
        let response = self.post_chat(&request).await?;
        let body: ChatCompletionResponse = decode(response).await?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| Error::Hub("no choices in response".to_string()))
    }

    /// Streaming chat completion. `on_token` sees each non-empty delta in
    /// order; an error from it stops the stream and is returned.
    pub async fn stream<F>(
        &self,
        model: &str,
        prompt: &str,
        options: &AskOptions,
        mut on_token: F,
    ) -> Result<()>
    where
        F: FnMut(&str) -> Result<()>,
    {
        let request = chat_request(model, prompt, options, true);
        let response = self.post_chat(&request).await?;
        let mut lines = LineReader::new(response);

        while let Some(line) = lines.next_line().await {
            let line = line.map_err(request_failed)?;
            let Some(data) = sse_data(&line) else {
                continue;
            };
            if data == DONE_SENTINEL {
                break;
            }
            if let Some(message) = data.strip_prefix(ERROR_PREFIX) {
                return Err(Error::Hub(format!("stream error: {}", message.trim())));
            }

            let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
                continue;
            };
            for choice in &chunk.choices {
                match choice.delta.content.as_deref() {
                    Some(content) if !content.is_empty() => on_token(content)?,
                    _ => {}
                }
            }
        }

        Ok(())
    }

    async fn post_chat(&self, request: &ChatCompletionRequest) -> Result<Response> {
        let response = self
            .http_client
            .post(format!("{}/v1/chat/completions", self.hub_url))
            .json(request)
            .send()
            .await
            .map_err(request_failed)?;
        ok_or_api_error(response).await
    }
}

fn chat_request(
    model: &str,
    prompt: &str,
    options: &AskOptions,
    stream: bool,
) -> ChatCompletionRequest {
    let mut request = ChatCompletionRequest::single_prompt(model, prompt);
    request.max_tokens = options.max_tokens.filter(|n| *n > 0);
    request.temperature = options.temperature;
    request.stream = stream;
    request
}

fn request_failed(e: reqwest::Error) -> Error {
    Error::Transport(format!("request failed: {}", e))
}

/// Turn any non-200 answer into `Error::Api`, preferring the JSON error
/// message over the raw body.
async fn ok_or_api_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorResponse>(&body)
        .ok()
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);

    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response.bytes().await.map_err(request_failed)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Hub(format!("failed to parse response: {}", e)))
}
