//! OpenAI-compatible chat completions over HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{CompletionBackend, CompletionRequest, CompletionResponse};
use crate::config::AiConfig;
use crate::tools::ToolExecutor;
use crate::{Error, Result};

pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key_secret: String,
    tools: Arc<ToolExecutor>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &AiConfig, tools: Arc<ToolExecutor>) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::Validation("ai.base_url must not be empty".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key_secret: config.api_key_secret.clone(),
            tools,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        // A missing key is a configuration problem, never worth retrying.
        let api_key = self.tools.get_secret(&self.api_key_secret).await.map_err(|e| Error::AiBackend {
            message: e.to_string(),
            retryable: false,
        })?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&self.build_body(request))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            return Err(parse_http_error(status, &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| Error::AiBackend {
            message: format!("unreadable completion response: {}", e),
            retryable: false,
        })?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::AiBackend {
                message: "completion response had no content".into(),
                retryable: true,
            })?;

        Ok(CompletionResponse {
            text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

/// Map a non-200 status to a backend error. Throttling and server faults
/// are retryable; client errors are not.
pub fn parse_http_error(status: u16, body: &str) -> Error {
    let snippet: String = body.chars().take(300).collect();
    let (message, retryable) = match status {
        401 => ("invalid API key".to_string(), false),
        403 => ("access denied".to_string(), false),
        404 => (format!("model or endpoint not found: {}", snippet), false),
        408 | 429 => (format!("throttled ({}): {}", status, snippet), true),
        400 => (format!("invalid request: {}", snippet), false),
        500..=599 => (format!("server error {}: {}", status, snippet), true),
        _ => (format!("HTTP {}: {}", status, snippet), false),
    };
    Error::AiBackend { message, retryable }
}
