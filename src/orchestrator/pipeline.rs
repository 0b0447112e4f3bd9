//! The background pipeline that carries a task up to the approval gate.
//!
//! Each loop iteration reloads the task and runs the stage for its current
//! status, so a pipeline started on a half-finished task picks up where the
//! previous process stopped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::Inner;
use crate::core::task::{TaskId, TaskStatus};
use crate::{Error, Result};

impl Inner {
    /// Run the pipeline for `id` and record any failure on the task.
    pub(super) async fn drive(self: Arc<Self>, id: TaskId, cancel: CancellationToken) {
        if let Err(e) = self.run_stages(id, &cancel).await {
            self.record_failure(id, &e).await;
        }
        self.forget_token(id);
    }

    #[instrument(skip(self, cancel), fields(task = %id))]
    async fn run_stages(&self, id: TaskId, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut task = self.store.get(id).await?;
            debug!(status = %task.status, "Pipeline stage");

            match task.status {
                TaskStatus::Pending => {
                    task.transition(TaskStatus::Decomposing)?;
                    self.save(&mut task).await?;
                }

                TaskStatus::Decomposing => {
                    let decomposition = tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        r = self.decomposer.decompose_task(&task.prompt) => r?,
                    };
                    let gates = decomposition.quality_gates.clone();
                    info!(
                        subtasks = decomposition.subtasks.len(),
                        tracks = decomposition.tracks.len(),
                        score = gates.score,
                        "Task decomposed"
                    );
                    task.decomposition = Some(decomposition);
                    if gates.passed() {
                        task.transition(TaskStatus::Generating)?;
                    } else {
                        warn!(blockers = ?gates.blockers, "Quality gates blocked the task");
                        task.fail(format!("Quality gates blocked the plan: {}", gates.blockers.join("; ")))?;
                    }
                    self.save(&mut task).await?;
                }

                TaskStatus::Generating => {
                    let decomposition = task
                        .decomposition
                        .clone()
                        .ok_or_else(|| Error::AiGeneration("task has no decomposition".into()))?;
                    let output = self.generator.generate(&task.prompt, &decomposition, cancel).await?;
                    if !output.failures.is_empty() {
                        warn!(failures = output.failures.len(), "Some files could not be generated");
                    }
                    task.generated_files = output.files;
                    task.generation_failures = output.failures;
                    task.transition(TaskStatus::Validating)?;
                    self.save(&mut task).await?;
                }

                TaskStatus::Validating => {
                    let mut files = task.generated_files.clone();
                    let report = self.validator.validate_and_heal(&task.prompt, &mut files, cancel).await?;
                    task.generated_files = files;
                    let escalation = (!report.safe).then(|| self.validator.escalation_error(&report));
                    task.validation_report = Some(report);
                    match escalation {
                        None => task.transition(TaskStatus::AwaitingApproval)?,
                        Some(e) => task.fail(e.to_string())?,
                    }
                    self.save(&mut task).await?;

                    if task.status == TaskStatus::AwaitingApproval && task.auto_approve {
                        info!("Auto-approving task");
                        // Failures are already recorded on the task by apply.
                        if let Err(e) = self.apply(id).await {
                            warn!(error = %e, "Auto-approved apply failed");
                        }
                    }
                    return Ok(());
                }

                TaskStatus::Applying => {
                    self.recover_interrupted_apply(id).await?;
                    return Ok(());
                }

                TaskStatus::AwaitingApproval | TaskStatus::Completed | TaskStatus::Failed => return Ok(()),
            }
        }
    }

    /// Mark the task failed with `err` unless it already reached a terminal
    /// state (for example through `cancel`).
    pub(super) async fn record_failure(&self, id: TaskId, err: &Error) {
        let message = err.to_string();
        let result = self
            .update(id, |t| {
                if !t.status.can_transition(TaskStatus::Failed) {
                    return Err(Error::state("fail", t.status));
                }
                t.fail(message.clone())
            })
            .await;
        match result {
            Ok(_) => error!(task = %id, code = err.code(), error = %err, "Task failed"),
            Err(Error::ApprovalState { .. }) => {
                debug!(task = %id, error = %err, "Pipeline stopped on a settled task")
            }
            Err(e) => error!(task = %id, error = %e, "Could not record task failure"),
        }
    }
}
