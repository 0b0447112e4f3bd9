use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded: {limit} operations per {window:?}, {remaining} remaining, retry in {retry_after:?}")]
    RateLimitExceeded {
        limit: usize,
        remaining: usize,
        window: Duration,
        retry_after: Duration,
    },

    #[error("Path rejected: {path}: {reason}")]
    PathSecurity { path: String, reason: String },

    #[error("Destructive operation blocked ({operation}): {reason}")]
    DestructiveOperationBlocked { operation: String, reason: String },

    #[error("AI generation failed: {0}")]
    AiGeneration(String),

    #[error("AI backend error: {message}")]
    AiBackend { message: String, retryable: bool },

    #[error("Static analysis failed: {0}")]
    StaticAnalysis(String),

    #[error("Tests failed: {0}")]
    TestFailure(String),

    #[error("Cannot {operation} task in state {state}")]
    ApprovalState { operation: String, state: String },

    #[error("Rollback unavailable: {0}")]
    RollbackUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Caller {caller} does not own task {task}")]
    Forbidden { caller: String, task: String },

    #[error("Version conflict on task {task}: expected {expected}, found {found}")]
    VersionConflict {
        task: String,
        expected: u64,
        found: u64,
    },

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Claude binary not found in PATH")]
    ClaudeBinaryNotFound,
}

impl Error {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Error::PathSecurity { .. } => "path_security_error",
            Error::DestructiveOperationBlocked { .. } => "destructive_operation_blocked",
            Error::AiGeneration(_) | Error::AiBackend { .. } => "ai_generation_failure",
            Error::StaticAnalysis(_) => "static_analysis_failure",
            Error::TestFailure(_) => "test_failure",
            Error::ApprovalState { .. } => "approval_state_error",
            Error::RollbackUnavailable(_) => "rollback_unavailable",
            Error::Cancelled => "cancelled",
            Error::TaskNotFound(_) => "task_not_found",
            Error::Forbidden { .. } => "forbidden",
            Error::VersionConflict { .. } => "version_conflict",
            Error::BranchExists(_) => "branch_exists",
            Error::SecretNotFound(_) => "secret_not_found",
            Error::Timeout(_) => "timeout",
            _ => "internal_error",
        }
    }

    /// Errors produced by the security and destructive-operation guards.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Error::PathSecurity { .. } | Error::DestructiveOperationBlocked { .. }
        )
    }

    pub(crate) fn path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PathSecurity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn blocked(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::DestructiveOperationBlocked {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn state(operation: impl Into<String>, state: impl ToString) -> Self {
        Error::ApprovalState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::NoHomeDir), "No home directory");
        assert_eq!(
            format!("{}", Error::Validation("empty prompt".to_string())),
            "Validation error: empty prompt"
        );
        assert_eq!(
            format!("{}", Error::state("approve", "pending")),
            "Cannot approve task in state pending"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::path("../x", "traversal").code(), "path_security_error");
        assert_eq!(Error::blocked("query", "DROP").code(), "destructive_operation_blocked");
        assert_eq!(
            Error::RollbackUnavailable("no snapshot".into()).code(),
            "rollback_unavailable"
        );
        assert_eq!(Error::NoHomeDir.code(), "internal_error");
    }

    #[test]
    fn test_is_security() {
        assert!(Error::path("/etc", "outside root").is_security());
        assert!(Error::blocked("command", "rm -rf /").is_security());
        assert!(!Error::Validation("x".into()).is_security());
    }

    #[test]
    fn test_rate_limit_message_includes_remaining() {
        let err = Error::RateLimitExceeded {
            limit: 100,
            remaining: 0,
            window: Duration::from_secs(60),
            retry_after: Duration::from_secs(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("100 operations"));
        assert!(msg.contains("0 remaining"));
    }
}
