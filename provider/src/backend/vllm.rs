//! vLLM backend (OpenAI-compatible completions API).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use super::lines::{sse_data, LineReader};
use super::{
    check_status, decode_json, http_client, normalize_url, unavailable, InferenceBackend,
    InferenceRequest, InferenceResult, TokenSink,
};
use crate::config::BackendKind;
use crate::error::Result;

pub const DEFAULT_VLLM_URL: &str = "http://localhost:8000";

const KIND: BackendKind = BackendKind::Vllm;

/// SSE sentinel that ends an OpenAI-style stream.
const DONE_SENTINEL: &str = "[DONE]";

pub struct VllmBackend {
    http_client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl VllmBackend {
    pub fn new(url: Option<&str>, model: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            base_url: normalize_url(url, DEFAULT_VLLM_URL),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn post_completions(
        &self,
        request: &InferenceRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = CompletionRequest {
            model: &self.model,
            prompt: &request.prompt,
            max_tokens: request.max_tokens_opt(),
            temperature: request.temperature_opt(),
            top_p: request.top_p_opt(),
            stream,
        };
        let url = format!("{}/v1/completions", self.base_url);
        let response = self
            .authorize(self.http_client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;
        check_status(KIND, response).await
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl CompletionChoice {
    fn is_finished(&self) -> bool {
        self.finish_reason.as_deref().is_some_and(|r| !r.is_empty())
    }
}

#[async_trait]
impl InferenceBackend for VllmBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        let response = self.post_completions(request, false).await?;
        let body: CompletionResponse = decode_json(KIND, response).await?;

        let text = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .unwrap_or_default();
        let (prompt_tokens, completion_tokens) = body
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(InferenceResult {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<InferenceResult> {
        let response = self.post_completions(request, true).await?;

        let mut result = InferenceResult::default();
        let mut lines = LineReader::new(response);

        while let Some(line) = lines.next_line().await {
            let line = line.map_err(|e| unavailable(KIND, e))?;
            let Some(data) = sse_data(&line) else {
                continue;
            };

            if data == DONE_SENTINEL {
                sink.on_token("", true).await?;
                break;
            }

            let Ok(chunk) = serde_json::from_str::<CompletionResponse>(data) else {
                continue;
            };

            // Usage may arrive on the finishing chunk or on a trailing one.
            if let Some(usage) = &chunk.usage {
                result.prompt_tokens = usage.prompt_tokens;
                result.completion_tokens = usage.completion_tokens;
            }

            if let Some(choice) = chunk.choices.first() {
                result.text.push_str(&choice.text);
                sink.on_token(&choice.text, choice.is_finished()).await?;
            }
        }

        Ok(result)
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .authorize(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;
        check_status(KIND, response).await?;
        Ok(())
    }
}
