//! Task lifecycle coordination.
//!
//! The orchestrator owns task records. `submit` persists a pending task and
//! spawns its pipeline on the runtime; the pipeline decomposes, generates and
//! validates, then parks the task at the approval gate. `approve` applies the
//! change under per-path locks with a snapshot taken first, and `rollback`
//! restores that snapshot later. Every status change is persisted through
//! the versioned [`TaskStore`] and broadcast as a [`TaskEvent`].

mod apply;
pub mod locks;
mod pipeline;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::AiClient;
use crate::codegen::CodeGenerator;
use crate::config::Config;
use crate::core::files::{GeneratedFile, ValidationReport};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::planning::{PatternRegistry, TaskDecomposer};
use crate::store::TaskStore;
use crate::tools::ToolExecutor;
use crate::validate::Validator;
use crate::{Error, Result};

pub use locks::FileLocks;

pub const MAX_PROMPT_CHARS: usize = 8_000;
const EVENT_CAPACITY: usize = 256;
const SETTLE_POLL: Duration = Duration::from_millis(25);

/// Broadcast after every persisted change to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub version: u64,
    pub error: Option<String>,
}

/// A file submitted for ad hoc validation.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInput {
    pub path: String,
    pub content: String,
}

pub(crate) struct Inner {
    tools: Arc<ToolExecutor>,
    store: TaskStore,
    decomposer: TaskDecomposer,
    generator: CodeGenerator,
    validator: Validator,
    locks: FileLocks,
    cancels: Mutex<HashMap<TaskId, CancellationToken>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Inner {
    fn emit(&self, task: &Task) {
        // No subscribers is fine.
        let _ = self.events.send(TaskEvent {
            task_id: task.id,
            status: task.status,
            version: task.version,
            error: task.error.clone(),
        });
    }

    async fn save(&self, task: &mut Task) -> Result<()> {
        self.store.save(task).await?;
        self.emit(task);
        Ok(())
    }

    async fn update<F>(&self, id: TaskId, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let task = self.store.update(id, f).await?;
        self.emit(&task);
        Ok(task)
    }

    fn forget_token(&self, id: TaskId) {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Assemble the pipeline from an existing tool layer and AI client.
    pub fn new(tools: Arc<ToolExecutor>, ai: AiClient, config: &Config, state_dir: &Path) -> Self {
        let patterns = Arc::new(PatternRegistry::new(
            config.planner.pattern_library.as_ref().map(PathBuf::from),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            store: TaskStore::new(state_dir),
            decomposer: TaskDecomposer::new(ai.clone(), patterns.clone(), config.planner.clone()),
            generator: CodeGenerator::new(tools.clone(), ai.clone(), patterns, config.generator.clone()),
            validator: Validator::new(tools.clone(), ai, config.validator.clone(), state_dir),
            locks: FileLocks::new(),
            cancels: Mutex::new(HashMap::new()),
            events,
            tools,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Build the tool layer and AI backend described by `config` for `root`.
    pub fn from_config(root: &Path, config: &Config) -> Result<Self> {
        config.validate()?;
        let state_dir = config.state_dir()?;
        let audit_file = config.tools.audit_to_file.then(|| state_dir.join("audit.log"));
        let tools = Arc::new(ToolExecutor::new(root, &config.tools, audit_file)?);
        let ai = AiClient::from_config(&config.ai, tools.clone())?;
        info!(
            root = %tools.root().display(),
            state_dir = %state_dir.display(),
            backend = ai.backend_name(),
            production = tools.is_production(),
            "Orchestrator ready"
        );
        Ok(Self::new(tools, ai, config, &state_dir))
    }

    pub fn tools(&self) -> &Arc<ToolExecutor> {
        &self.inner.tools
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Persist a pending task and start its pipeline in the background.
    pub async fn submit(&self, owner: &str, prompt: &str, auto_approve: bool) -> Result<Task> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(Error::Validation("caller identity is required".into()));
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(Error::Validation("prompt must not be empty".into()));
        }
        let chars = prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            return Err(Error::Validation(format!(
                "prompt is {} characters, the limit is {}",
                chars, MAX_PROMPT_CHARS
            )));
        }

        let mut task = Task::new(owner, prompt, auto_approve);
        self.inner.store.insert(&mut task).await?;
        self.inner.emit(&task);
        info!(task = %task.id, owner, auto_approve, "Task submitted");
        self.spawn(task.id);
        Ok(task)
    }

    fn spawn(&self, id: TaskId) {
        let token = CancellationToken::new();
        self.inner
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token.clone());
        let inner = self.inner.clone();
        tokio::spawn(inner.drive(id, token));
    }

    async fn owned(&self, id: TaskId, owner: &str) -> Result<Task> {
        let task = self.inner.store.get(id).await?;
        if task.owner != owner {
            warn!(task = %id, caller = owner, "Caller does not own task");
            return Err(Error::Forbidden {
                caller: owner.to_string(),
                task: id.to_string(),
            });
        }
        Ok(task)
    }

    pub async fn get(&self, id: TaskId, owner: &str) -> Result<Task> {
        self.owned(id, owner).await
    }

    /// Apply an approved task. Only valid from `awaiting_approval` with a
    /// safe report; anything else is rejected without touching the task.
    pub async fn approve(&self, id: TaskId, owner: &str) -> Result<Task> {
        let task = self.owned(id, owner).await?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(Error::state("approve", task.status));
        }
        if !task.is_safe() {
            return Err(Error::state("approve", "awaiting_approval with an unsafe report"));
        }
        info!(task = %id, owner, "Task approved");
        self.inner.apply(id).await
    }

    pub async fn rollback(&self, id: TaskId, owner: &str) -> Result<Task> {
        let task = self.owned(id, owner).await?;
        if task.status != TaskStatus::Completed {
            return Err(Error::state("roll back", task.status));
        }
        if task.snapshot_id.is_none() {
            return Err(Error::RollbackUnavailable(format!("task {} has no snapshot", id)));
        }
        self.inner.rollback(id).await
    }

    /// Stop a task that has not started applying.
    pub async fn cancel(&self, id: TaskId, owner: &str) -> Result<Task> {
        self.owned(id, owner).await?;
        let task = self
            .inner
            .update(id, |t| {
                if !t.status.is_cancellable() {
                    return Err(Error::state("cancel", t.status));
                }
                t.fail(Error::Cancelled.to_string())
            })
            .await?;
        let token = self
            .inner
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }
        info!(task = %id, owner, "Task cancelled");
        Ok(task)
    }

    /// Poll until the task stops at the approval gate or a terminal state.
    /// Auto-approved tasks are only settled once terminal.
    pub async fn wait_until_settled(&self, id: TaskId, timeout: Duration) -> Result<Task> {
        tokio::time::timeout(timeout, self.poll_settled(id))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    async fn poll_settled(&self, id: TaskId) -> Result<Task> {
        loop {
            let task = self.inner.store.get(id).await?;
            // Auto-approved tasks pass through the gate on their own.
            let parked = task.status == TaskStatus::AwaitingApproval && task.auto_approve;
            if task.status.is_settled() && !parked {
                return Ok(task);
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    /// Restart pipelines for tasks a previous process left in flight.
    /// Tasks interrupted while applying are rolled back and failed.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let mut resumed = 0;
        for task in self.inner.store.list().await? {
            match task.status {
                TaskStatus::Applying => {
                    self.inner.recover_interrupted_apply(task.id).await?;
                    resumed += 1;
                }
                TaskStatus::Pending | TaskStatus::Decomposing | TaskStatus::Generating | TaskStatus::Validating => {
                    debug!(task = %task.id, status = %task.status, "Resuming task");
                    self.spawn(task.id);
                    resumed += 1;
                }
                TaskStatus::AwaitingApproval | TaskStatus::Completed | TaskStatus::Failed => {}
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed interrupted tasks");
        }
        Ok(resumed)
    }

    /// Validate files outside any task lifecycle. Nothing is written.
    pub async fn validate_files(&self, files: Vec<FileInput>) -> Result<ValidationReport> {
        if files.is_empty() {
            return Err(Error::Validation("no files to validate".into()));
        }
        let mut generated = Vec::with_capacity(files.len());
        for file in files {
            let path = self.inner.tools.relative_path(&file.path)?;
            if path.is_empty() {
                return Err(Error::Validation("file path must not be empty".into()));
            }
            generated.push(GeneratedFile::new(&path, None, file.content, "submitted for validation"));
        }
        self.inner.validator.validate(&generated).await
    }
}
