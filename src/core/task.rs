//! Task record and lifecycle state machine.
//!
//! A task carries one change request from prompt to applied commit. Its
//! status only moves along the edges listed in [`TaskStatus::can_transition`];
//! every accepted move is appended to the task's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::files::{GeneratedFile, GenerationFailure, ValidationReport};
use crate::core::plan::Decomposition;
use crate::error::{Error, Result};

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a task.
///
/// `pending → decomposing → generating → validating → awaiting_approval →
/// applying → completed`; any state before `applying` may fail, and
/// `applying` resolves to either `completed` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Decomposing,
    Generating,
    Validating,
    AwaitingApproval,
    Applying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn can_transition(self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Decomposing)
                | (Decomposing, Generating)
                | (Generating, Validating)
                | (Validating, AwaitingApproval)
                | (AwaitingApproval, Applying)
                | (Applying, Completed)
                | (Pending, Failed)
                | (Decomposing, Failed)
                | (Generating, Failed)
                | (Validating, Failed)
                | (AwaitingApproval, Failed)
                | (Applying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// States in which the task can still be cancelled.
    pub fn is_cancellable(self) -> bool {
        !self.is_terminal() && self != TaskStatus::Applying
    }

    /// States where the pipeline has stopped and is waiting on a caller.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == TaskStatus::AwaitingApproval
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Decomposing => "decomposing",
            TaskStatus::Generating => "generating",
            TaskStatus::Validating => "validating",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Applying => "applying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record of a status transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: TaskStatus,
    pub entered_at: DateTime<Utc>,
}

/// The durable record of one change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub owner: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub auto_approve: bool,
    pub decomposition: Option<Decomposition>,
    #[serde(default)]
    pub generated_files: Vec<GeneratedFile>,
    #[serde(default)]
    pub generation_failures: Vec<GenerationFailure>,
    pub validation_report: Option<ValidationReport>,
    pub error: Option<String>,
    pub snapshot_id: Option<String>,
    pub commit: Option<String>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<StatusHistoryEntry>,
    /// Optimistic concurrency counter, bumped by every store write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(owner: &str, prompt: &str, auto_approve: bool) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            owner: owner.to_string(),
            prompt: prompt.to_string(),
            status: TaskStatus::Pending,
            auto_approve,
            decomposition: None,
            generated_files: Vec::new(),
            generation_failures: Vec::new(),
            validation_report: None,
            error: None,
            snapshot_id: None,
            commit: None,
            rolled_back_at: None,
            history: vec![StatusHistoryEntry {
                status: TaskStatus::Pending,
                entered_at: now,
            }],
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `target`, or fail with a conflict leaving the task untouched.
    pub fn transition(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::state(
                format!("move to {}", target),
                self.status,
            ));
        }
        let now = Utc::now();
        self.status = target;
        self.updated_at = now;
        self.history.push(StatusHistoryEntry {
            status: target,
            entered_at: now,
        });
        Ok(())
    }

    /// Transition to `failed`, retaining the error for inspection.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Relative paths this task will write or delete on apply.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .generated_files
            .iter()
            .map(|f| f.path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn is_safe(&self) -> bool {
        self.validation_report
            .as_ref()
            .map(|r| r.safe)
            .unwrap_or(false)
    }
}
