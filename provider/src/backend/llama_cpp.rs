//! llama.cpp server backend.
//!
//! Uses the native `/completion` endpoint, which streams SSE frames carrying
//! a `stop` flag on the last one.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::lines::{sse_data, LineReader};
use super::{
    check_status, decode_json, http_client, normalize_url, unavailable, InferenceBackend,
    InferenceRequest, InferenceResult, TokenSink,
};
use crate::config::BackendKind;
use crate::error::Result;

pub const DEFAULT_LLAMA_CPP_URL: &str = "http://localhost:8080";

const KIND: BackendKind = BackendKind::LlamaCpp;

pub struct LlamaCppBackend {
    http_client: Client,
    base_url: String,
}

impl LlamaCppBackend {
    pub fn new(url: Option<&str>) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            base_url: normalize_url(url, DEFAULT_LLAMA_CPP_URL),
        })
    }

    async fn post_completion(
        &self,
        request: &InferenceRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = CompletionRequest {
            prompt: &request.prompt,
            n_predict: request.max_tokens_opt(),
            temperature: request.temperature_opt(),
            top_p: request.top_p_opt(),
            stream,
        };
        let url = format!("{}/completion", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;
        check_status(KIND, response).await
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    tokens_evaluated: u32,
    #[serde(default)]
    tokens_predicted: u32,
}

#[async_trait]
impl InferenceBackend for LlamaCppBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        let response = self.post_completion(request, false).await?;
        let body: CompletionResponse = decode_json(KIND, response).await?;

        Ok(InferenceResult {
            text: body.content,
            prompt_tokens: body.tokens_evaluated,
            completion_tokens: body.tokens_predicted,
        })
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<InferenceResult> {
        let response = self.post_completion(request, true).await?;

        let mut result = InferenceResult::default();
        let mut lines = LineReader::new(response);

        while let Some(line) = lines.next_line().await {
            let line = line.map_err(|e| unavailable(KIND, e))?;
            let Some(data) = sse_data(&line) else {
                continue;
            };
            let Ok(chunk) = serde_json::from_str::<CompletionResponse>(data) else {
                continue;
            };

            result.text.push_str(&chunk.content);
            sink.on_token(&chunk.content, chunk.stop).await?;

            if chunk.stop {
                result.prompt_tokens = chunk.tokens_evaluated;
                result.completion_tokens = chunk.tokens_predicted;
                break;
            }
        }

        Ok(result)
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(KIND, e))?;
        check_status(KIND, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::RecordingSink;
    use crate::error::Error;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> InferenceRequest {
        InferenceRequest {
            prompt: "Once upon".to_string(),
            max_tokens: 8,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .and(body_partial_json(json!({
                "prompt": "Once upon",
                "n_predict": 8,
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": " a time",
                "stop": true,
                "tokens_evaluated": 3,
                "tokens_predicted": 2
            })))
            .mount(&server)
            .await;

        let backend = LlamaCppBackend::new(Some(&server.uri())).unwrap();
        let result = backend.complete(&request()).await.unwrap();
        assert_eq!(result.text, " a time");
        assert_eq!(result.usage().total_tokens, 5);
    }

    #[tokio::test]
    async fn test_stream_sse_until_stop() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"content\":\" a\",\"stop\":false}\n\n",
            "data: {\"content\":\" time\",\"stop\":false}\n\n",
            "data: {\"content\":\"\",\"stop\":true,\"tokens_evaluated\":3,\"tokens_predicted\":2}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let backend = LlamaCppBackend::new(Some(&server.uri())).unwrap();
        let mut sink = RecordingSink::default();
        let result = backend.stream(&request(), &mut sink).await.unwrap();

        assert_eq!(result.text, " a time");
        assert_eq!(result.prompt_tokens, 3);
        assert_eq!(result.completion_tokens, 2);
        assert_eq!(sink.tokens.len(), 3);
        assert_eq!(sink.tokens.last(), Some(&(String::new(), true)));
    }

    #[tokio::test]
    async fn test_health_non_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .mount(&server)
            .await;

        let backend = LlamaCppBackend::new(Some(&server.uri())).unwrap();
        match backend.health().await {
            Err(Error::Backend { status, .. }) => assert_eq!(status, 503),
            other => panic!("Expected Backend error, got {:?}", other),
        }
    }
}
