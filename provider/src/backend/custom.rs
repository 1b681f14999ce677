//! Generic JSON endpoint.
//!
//! The endpoint takes `{"prompt", "max_tokens", "temperature", "top_p"}` and
//! answers `{"text", "prompt_tokens", "completion_tokens"}`. It has no
//! streaming mode, so a stream is the whole completion as one final fragment.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use super::{
    check_status, decode_json, http_client, unavailable, InferenceBackend, InferenceRequest,
    InferenceResult, TokenSink,
};
use crate::config::BackendKind;
use crate::error::{Error, Result};

const KIND: BackendKind = BackendKind::Custom;

pub struct CustomBackend {
    http_client: Client,
    url: String,
    api_key: Option<String>,
}

impl CustomBackend {
    pub fn new(url: Option<&str>, api_key: Option<String>) -> Result<Self> {
        let url = url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Configuration("custom backend requires a URL".to_string()))?;

        Ok(Self {
            http_client: http_client()?,
            url: url.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[derive(Debug, Serialize)]
struct CustomRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CustomResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl InferenceBackend for CustomBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        let body = CustomRequest {
            prompt: &request.prompt,
            max_tokens: request.max_tokens_opt(),
            temperature: request.temperature_opt(),
            top_p: request.top_p_opt(),
        };
        let response = self
            .authorize(self.http_client.post(&self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;
        let response = check_status(KIND, response).await?;
        let body: CustomResponse = decode_json(KIND, response).await?;

        Ok(InferenceResult {
            text: body.text,
            prompt_tokens: body.prompt_tokens,
            completion_tokens: body.completion_tokens,
        })
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<InferenceResult> {
        let result = self.complete(request).await?;
        sink.on_token(&result.text, true).await?;
        Ok(result)
    }

    /// Any status below 500 counts as healthy: POST-only endpoints commonly
    /// answer a GET with 405.
    async fn health(&self) -> Result<()> {
        let response = self
            .authorize(self.http_client.get(&self.url))
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Backend {
                backend: KIND.as_str(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
