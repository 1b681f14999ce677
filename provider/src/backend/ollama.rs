//! Ollama backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::lines::LineReader;
use super::{
    check_status, decode_json, http_client, normalize_url, unavailable, InferenceBackend,
    InferenceRequest, InferenceResult, TokenSink,
};
use crate::config::BackendKind;
use crate::error::{Error, Result};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

const KIND: BackendKind = BackendKind::Ollama;

/// Talks to an Ollama server through `/api/generate`.
pub struct OllamaBackend {
    http_client: Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(url: Option<&str>, model: &str) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            base_url: normalize_url(url, DEFAULT_OLLAMA_URL),
            model: model.to_string(),
        })
    }

    fn generate_request<'a>(
        &'a self,
        request: &'a InferenceRequest,
        stream: bool,
    ) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream,
            options: GenerateOptions {
                num_predict: request.max_tokens_opt(),
                temperature: request.temperature_opt(),
                top_p: request.top_p_opt(),
            },
        }
    }

    async fn post_generate(&self, body: &GenerateRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;
        check_status(KIND, response).await
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

/// Response from /api/tags endpoint.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Ollama reports names like "llama3:latest"; accept the bare name too.
fn model_matches(listed: &str, wanted: &str) -> bool {
    listed == wanted || listed.strip_suffix(":latest") == Some(wanted)
}

// ============================================================================
// InferenceBackend implementation
// ============================================================================

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        let response = self
            .post_generate(&self.generate_request(request, false))
            .await?;
        let body: GenerateResponse = decode_json(KIND, response).await?;

        Ok(InferenceResult {
            text: body.response,
            prompt_tokens: body.prompt_eval_count,
            completion_tokens: body.eval_count,
        })
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<InferenceResult> {
        let response = self
            .post_generate(&self.generate_request(request, true))
            .await?;

        let mut result = InferenceResult::default();
        let mut lines = LineReader::new(response);

        while let Some(line) = lines.next_line().await {
            let line = line.map_err(|e| unavailable(KIND, e))?;
            let Ok(chunk) = serde_json::from_str::<GenerateResponse>(&line) else {
                continue;
            };

            result.text.push_str(&chunk.response);
            sink.on_token(&chunk.response, chunk.done).await?;

            if chunk.done {
                result.prompt_tokens = chunk.prompt_eval_count;
                result.completion_tokens = chunk.eval_count;
                break;
            }
        }

        Ok(result)
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;
        let response = check_status(KIND, response).await?;
        let tags: TagsResponse = decode_json(KIND, response).await?;

        if tags.models.iter().any(|m| model_matches(&m.name, &self.model)) {
            return Ok(());
        }

        Err(Error::ModelNotFound {
            model: self.model.clone(),
            available: tags.models.into_iter().map(|m| m.name).collect(),
        })
    }
}
