//! Completion backends and the retrying client the pipeline talks to.
//!
//! Nothing outside this module sees raw completion text except through
//! [`schema`], which turns it into typed values or an error.

pub mod claude;
pub mod http;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AiConfig, BackendKind};
use crate::tools::ToolExecutor;
use crate::{Error, Result};

pub use claude::ClaudeHeadless;
pub use http::HttpBackend;

/// Longest sleep between two completion attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Which pipeline stage a completion serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Decompose,
    Generate,
    Heal,
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Purpose::Decompose => write!(f, "decompose"),
            Purpose::Generate => write!(f, "generate"),
            Purpose::Heal => write!(f, "heal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub purpose: Purpose,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
}

/// A service that turns a prompt into text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Wraps a backend with a per-attempt timeout and bounded retry.
#[derive(Clone)]
pub struct AiClient {
    backend: Arc<dyn CompletionBackend>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
    max_tokens: u32,
    temperature: f32,
}

impl AiClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &AiConfig) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    /// Build the backend named in `config`.
    pub fn from_config(config: &AiConfig, tools: Arc<ToolExecutor>) -> Result<Self> {
        let backend: Arc<dyn CompletionBackend> = match config.backend {
            BackendKind::Http => Arc::new(HttpBackend::new(config, tools)?),
            BackendKind::Claude => Arc::new(ClaudeHeadless::new(tools.root())?),
        };
        Ok(Self::new(backend, config))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn request(&self, purpose: Purpose, system: &str, prompt: String) -> CompletionRequest {
        CompletionRequest {
            purpose,
            system: system.to_string(),
            prompt,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Run one completion. Transient failures are retried with exponential
    /// backoff; anything left over is reported as an AI generation failure.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, self.backend.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.timeout)),
            };

            match outcome {
                Ok(response) => {
                    debug!(
                        backend = self.backend.name(),
                        purpose = %request.purpose,
                        attempt,
                        chars = response.text.len(),
                        "Completion finished"
                    );
                    return Ok(response);
                }
                Err(e) if is_retryable(&e) && attempt < self.max_retries => {
                    let delay = backoff_delay(self.backoff, attempt);
                    warn!(
                        backend = self.backend.name(),
                        purpose = %request.purpose,
                        attempt,
                        error = %e,
                        ?delay,
                        "Completion failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(Error::AiGeneration(msg)) => return Err(Error::AiGeneration(msg)),
                Err(e) => {
                    return Err(Error::AiGeneration(format!(
                        "{} backend failed after {} attempt(s): {}",
                        self.backend.name(),
                        attempt + 1,
                        e
                    )))
                }
            }
        }
    }
}

impl std::fmt::Debug for AiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiClient")
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Exponential backoff for `attempt` (0-based), capped at [`MAX_BACKOFF`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_BACKOFF)
}

fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Timeout(_) | Error::Http(_) => true,
        Error::AiBackend { retryable, .. } => *retryable,
        _ => false,
    }
}
