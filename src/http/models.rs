//! Request/response bodies and the error-to-status mapping.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::core::task::{TaskId, TaskStatus};
use crate::Error;

// ============= Tasks =============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub prompt: String,
    #[serde(default)]
    pub auto_approve: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

// ============= Validation =============

#[derive(Debug, Deserialize)]
pub struct ValidateFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub files: Vec<ValidateFile>,
}

// ============= Health =============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: f64,
    /// Tool operations left in the current rate window.
    pub tool_budget: usize,
}

// ============= Error Handling =============

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(Error::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) | Error::PathSecurity { .. } => StatusCode::BAD_REQUEST,
            Error::Forbidden { .. } | Error::DestructiveOperationBlocked { .. } => StatusCode::FORBIDDEN,
            Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Error::ApprovalState { .. }
            | Error::VersionConflict { .. }
            | Error::RollbackUnavailable(_)
            | Error::BranchExists(_) => StatusCode::CONFLICT,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "Request failed");
        } else {
            warn!(status = status.as_u16(), code = self.0.code(), error = %self.0, "Request rejected");
        }

        let retry_after = match &self.0 {
            Error::RateLimitExceeded { retry_after, .. } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_submit_request_defaults() {
        let req: SubmitRequest = serde_json::from_str(r#"{"prompt":"Add x"}"#).unwrap();
        assert!(!req.auto_approve);
        let req: SubmitRequest = serde_json::from_str(r#"{"prompt":"Add x","autoApprove":true}"#).unwrap();
        assert!(req.auto_approve);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::Validation("x".into()), 400),
            (Error::path("../x", "traversal"), 400),
            (
                Error::Forbidden {
                    caller: "a".into(),
                    task: "t".into(),
                },
                403,
            ),
            (Error::TaskNotFound("t".into()), 404),
            (Error::state("approve", "pending"), 409),
            (Error::RollbackUnavailable("gone".into()), 409),
            (
                Error::RateLimitExceeded {
                    limit: 1,
                    remaining: 0,
                    window: Duration::from_secs(60),
                    retry_after: Duration::from_secs(3),
                },
                429,
            ),
            (Error::NoHomeDir, 500),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status().as_u16(), status);
        }
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = ApiError(Error::RateLimitExceeded {
            limit: 1,
            remaining: 0,
            window: Duration::from_secs(60),
            retry_after: Duration::from_millis(2500),
        })
        .into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
