//! Completion backend that drives the `claude` CLI in headless mode.
//!
//! Runs `claude -p <prompt> --output-format json` in the project root and
//! reads the single JSON result envelope from stdout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{CompletionBackend, CompletionRequest, CompletionResponse};
use crate::{Error, Result};

/// Outcome reported by the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    Success { output: String },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct ClaudeResponse {
    pub session_id: Option<String>,
    pub result: ResultType,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
}

impl ClaudeResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.result, ResultType::Success { .. })
    }
}

#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaudeHeadless {
    binary: PathBuf,
    cwd: PathBuf,
}

impl ClaudeHeadless {
    /// Locate `claude` on PATH; completions run with `cwd` as working dir.
    pub fn new(cwd: &Path) -> Result<Self> {
        let binary = which::which("claude").map_err(|_| Error::ClaudeBinaryNotFound)?;
        Ok(Self::with_binary(binary, cwd))
    }

    pub fn with_binary(binary: PathBuf, cwd: &Path) -> Self {
        Self {
            binary,
            cwd: cwd.to_path_buf(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Parse the JSON envelope printed with `--output-format json`.
    pub fn parse_json_response(json_str: &str) -> Result<ClaudeResponse> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str.trim())?;

        let result = match raw.subtype.as_deref() {
            Some("success") => ResultType::Success {
                output: raw.result.unwrap_or_default(),
            },
            Some(_) => ResultType::Error {
                message: raw
                    .error
                    .or(raw.result)
                    .unwrap_or_else(|| "claude reported an error".to_string()),
            },
            None => match (raw.error, raw.result) {
                (Some(error), _) => ResultType::Error { message: error },
                (None, Some(result)) => ResultType::Success { output: result },
                (None, None) => ResultType::Error {
                    message: "Unknown response format".to_string(),
                },
            },
        };

        Ok(ClaudeResponse {
            session_id: raw.session_id,
            result,
            cost_usd: raw.total_cost_usd,
            duration_ms: raw.duration_ms,
            num_turns: raw.num_turns,
        })
    }
}

#[async_trait]
impl CompletionBackend for ClaudeHeadless {
    fn name(&self) -> &str {
        "claude"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let prompt = format!("{}\n\n{}", request.system, request.prompt);
        let output = Command::new(&self.binary)
            .arg("-p")
            .arg(&prompt)
            .arg("--output-format")
            .arg("json")
            .current_dir(&self.cwd)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response = match Self::parse_json_response(&stdout) {
            Ok(response) => response,
            Err(_) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = if stderr.trim().is_empty() {
                    format!("claude exited with code {}", output.status.code().unwrap_or(-1))
                } else {
                    stderr.trim().to_string()
                };
                return Err(Error::AiBackend {
                    message,
                    retryable: true,
                });
            }
            Err(_) => ClaudeResponse {
                session_id: None,
                result: ResultType::Success {
                    output: stdout.trim().to_string(),
                },
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
            },
        };

        match response.result {
            ResultType::Success { output } => Ok(CompletionResponse {
                text: output,
                model: "claude".to_string(),
            }),
            ResultType::Error { message } => Err(Error::AiBackend {
                message,
                retryable: true,
            }),
        }
    }
}
