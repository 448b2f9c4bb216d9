//! Completion backends the workers can call.
//!
//! Neither backend retries on its own: a retryable [`CompletionError`] makes
//! the worker nack the delivery and the broker redeliver it later.

use crate::server::config::{CompletionBackend, CompletionConfig};
use anyhow::Context;
use async_trait::async_trait;
use chunkcast::{CompletionError, CompletionRequest, CompletionService};
use reqwest::{
    Client, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Builds the backend selected by `config`.
pub fn build_completion(config: &CompletionConfig) -> anyhow::Result<Arc<dyn CompletionService>> {
    Ok(match config.backend {
        CompletionBackend::Echo => Arc::new(EchoCompletion),
        CompletionBackend::Openai => Arc::new(OpenAiCompletion::new(config)?),
    })
}

/// Returns the prompt as the completion.
pub struct EchoCompletion;

#[async_trait]
impl CompletionService for EchoCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        Ok(request.prompt)
    }
}

/// Client for OpenAI-compatible `chat/completions` endpoints.
#[derive(Clone)]
pub struct OpenAiCompletion {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiCompletion {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.model.trim().is_empty(), "missing completion model name");

        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let auth = format!("Bearer {}", api_key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid completion API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build completion HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let body = ChatRequest {
            model: &self.model,
            max_tokens: request.max_output_tokens,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, body));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout
            } else {
                CompletionError::Permanent(format!("malformed completion response: {e}"))
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::Permanent("completion response has no content".to_string()))
    }
}

fn classify_status(status: StatusCode, body: String) -> CompletionError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CompletionError::Timeout,
        s if s.is_server_error() => CompletionError::Unavailable(format!("{s}: {body}")),
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            CompletionError::InvalidInput(format!("{status}: {body}"))
        }
        s => CompletionError::Permanent(format!("{s}: {body}")),
    }
}

fn classify_transport(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        CompletionError::Unavailable(err.to_string())
    } else {
        CompletionError::Permanent(err.to_string())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}
