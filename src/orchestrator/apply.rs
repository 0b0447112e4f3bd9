//! Approval, apply, rollback and crash recovery.

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use super::Inner;
use crate::core::files::FileAction;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::validate::snapshot::patient;
use crate::{Error, Result};

/// Subject lines longer than this are cut in commit messages.
const COMMIT_SUBJECT_CHARS: usize = 72;

impl Inner {
    /// Snapshot, write, verify and commit an approved task. Any failure
    /// after the snapshot restores it before the task is marked failed.
    #[instrument(skip(self), fields(task = %id))]
    pub(super) async fn apply(&self, id: TaskId) -> Result<Task> {
        let paths = self.store.get(id).await?.touched_paths();
        let _guards = self.locks.acquire(&paths).await;

        self.update(id, |t| {
            if t.status != TaskStatus::AwaitingApproval {
                return Err(Error::state("approve", t.status));
            }
            if !t.is_safe() {
                return Err(Error::state("approve", "awaiting_approval with an unsafe report"));
            }
            t.transition(TaskStatus::Applying)
        })
        .await?;
        info!(files = paths.len(), "Applying task");

        let snapshot = match self.validator.snapshot(Some(id), &paths).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let message = format!("Snapshot failed, nothing was applied: {}", e);
                self.update(id, |t| t.fail(message)).await?;
                return Err(e);
            }
        };
        let task = match self
            .update(id, |t| {
                t.snapshot_id = Some(snapshot.id.clone());
                Ok(())
            })
            .await
        {
            Ok(task) => task,
            Err(e) => {
                // Nothing written yet; the snapshot is simply discarded.
                let _ = self.validator.snapshots().remove(&snapshot.id).await;
                self.record_failure(id, &e).await;
                return Err(e);
            }
        };

        match self.write_changes(&task, snapshot.head.is_some()).await {
            Ok(commit) => {
                let done = self
                    .update(id, |t| {
                        t.commit = commit;
                        t.transition(TaskStatus::Completed)
                    })
                    .await?;
                info!(commit = ?done.commit, "Task applied");
                Ok(done)
            }
            Err(e) => {
                warn!(error = %e, "Apply failed, rolling back");
                let rolled_back = match self.validator.rollback(&snapshot.id).await {
                    Ok(report) => {
                        info!(restored = report.restored.len(), deleted = report.deleted.len(), "Automatic rollback finished");
                        true
                    }
                    Err(re) => {
                        error!(error = %re, snapshot = %snapshot.id, "Automatic rollback failed");
                        false
                    }
                };
                let message = if rolled_back {
                    format!("Apply failed and was rolled back: {}", e)
                } else {
                    format!("Apply failed and rollback did not complete: {}", e)
                };
                self.update(id, |t| {
                    if rolled_back {
                        t.snapshot_id = None;
                        t.rolled_back_at = Some(Utc::now());
                    }
                    t.fail(message)
                })
                .await?;
                Err(e)
            }
        }
    }

    /// Write every change, optionally re-run tests, and commit when the root
    /// had a HEAD to return to.
    async fn write_changes(&self, task: &Task, commit: bool) -> Result<Option<String>> {
        for file in &task.generated_files {
            match file.action() {
                FileAction::Delete => {
                    patient(|| self.tools.delete_file(&file.path)).await?;
                }
                FileAction::Create | FileAction::Modify => {
                    patient(|| self.tools.write_file(&file.path, file.content())).await?;
                }
            }
        }

        if self.validator.config().verify_after_apply {
            let tests = self.validator.run_tests().await?;
            if !tests.success {
                return Err(Error::TestFailure(format!(
                    "{} failed, {} passed after applying",
                    tests.failed, tests.passed
                )));
            }
        }

        if !commit {
            return Ok(None);
        }
        let message = commit_message(task);
        Ok(Some(patient(|| self.tools.git_commit(&message)).await?))
    }

    /// Restore a completed task's snapshot and consume it.
    #[instrument(skip(self), fields(task = %id))]
    pub(super) async fn rollback(&self, id: TaskId) -> Result<Task> {
        let task = self.store.get(id).await?;
        let paths = task.touched_paths();
        let _guards = self.locks.acquire(&paths).await;

        // Re-read under the locks; a concurrent rollback may have won.
        let task = self.store.get(id).await?;
        if task.status != TaskStatus::Completed {
            return Err(Error::state("roll back", task.status));
        }
        let snapshot_id = task
            .snapshot_id
            .clone()
            .ok_or_else(|| Error::RollbackUnavailable(format!("task {} has no snapshot", id)))?;

        let report = self.validator.rollback(&snapshot_id).await?;
        let task = self
            .update(id, |t| {
                t.snapshot_id = None;
                t.rolled_back_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!(restored = report.restored.len(), deleted = report.deleted.len(), "Task rolled back");
        Ok(task)
    }

    /// A task left in `applying` by a crash: restore its snapshot if one was
    /// recorded, then fail it.
    pub(super) async fn recover_interrupted_apply(&self, id: TaskId) -> Result<()> {
        let task = self.store.get(id).await?;
        let paths = task.touched_paths();
        let _guards = self.locks.acquire(&paths).await;

        let rolled_back = match &task.snapshot_id {
            Some(snapshot_id) => match self.validator.rollback(snapshot_id).await {
                Ok(_) => true,
                Err(e) => {
                    error!(task = %id, error = %e, "Could not roll back interrupted apply");
                    false
                }
            },
            None => false,
        };
        let message = if rolled_back {
            "Interrupted while applying; changes were rolled back"
        } else {
            "Interrupted while applying"
        };
        self.update(id, |t| {
            if rolled_back {
                t.snapshot_id = None;
                t.rolled_back_at = Some(Utc::now());
            }
            t.fail(message)
        })
        .await?;
        warn!(task = %id, rolled_back, "Recovered interrupted apply");
        Ok(())
    }
}

fn commit_message(task: &Task) -> String {
    let first = task.prompt.lines().next().unwrap_or("").trim();
    let subject: String = first.chars().take(COMMIT_SUBJECT_CHARS).collect();
    format!("devpilot: {}\n\nTask: {}\n", subject, task.id)
}
