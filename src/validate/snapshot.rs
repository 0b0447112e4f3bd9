//! Durable pre-apply snapshots and rollback.
//!
//! A snapshot records, for every path a task will touch, the exact bytes on
//! disk (base64) or that the file did not exist, plus the HEAD commit when
//! the root is a repository. Snapshots are JSON files under
//! `<state_dir>/snapshots/` so a rollback survives a restart.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::task::TaskId;
use crate::tools::ToolExecutor;
use crate::util::{blocking, write_atomic};
use crate::{Error, Result};

/// Attempts per tool call when the rate limiter pushes back during rollback.
const RATE_LIMIT_RETRIES: u32 = 5;
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    pub path: String,
    /// Base64 of the original bytes; `None` when the file was absent.
    pub content: Option<String>,
}

impl FileSnapshot {
    pub fn bytes(&self) -> Result<Option<Vec<u8>>> {
        self.content
            .as_ref()
            .map(|c| {
                STANDARD
                    .decode(c)
                    .map_err(|e| Error::RollbackUnavailable(format!("corrupt snapshot of {}: {}", self.path, e)))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub head: Option<String>,
    pub files: Vec<FileSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub restored: Vec<String>,
    pub deleted: Vec<String>,
    pub head_reset: bool,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("snapshots"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if Uuid::parse_str(id).is_err() {
            return Err(Error::RollbackUnavailable(format!("invalid snapshot id {}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// Capture `paths` through the tool layer and persist the result.
    pub async fn capture(&self, tools: &ToolExecutor, task_id: Option<TaskId>, paths: &[String]) -> Result<Snapshot> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = patient(|| tools.read_bytes(path)).await?;
            files.push(FileSnapshot {
                path: path.clone(),
                content: bytes.map(|b| STANDARD.encode(b)),
            });
        }
        let head = patient(|| tools.git_head()).await?;
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            task_id,
            created_at: Utc::now(),
            head,
            files,
        };
        self.save(&snapshot).await?;
        info!(
            snapshot = %snapshot.id,
            files = snapshot.files.len(),
            head = ?snapshot.head,
            "Snapshot captured"
        );
        Ok(snapshot)
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.path_for(&snapshot.id)?;
        let json = serde_json::to_vec_pretty(snapshot)?;
        blocking(move || write_atomic(&path, &json)).await
    }

    pub async fn load(&self, id: &str) -> Result<Snapshot> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::RollbackUnavailable(format!("snapshot {} not found", id)))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Put every captured path back to its recorded bytes, delete files that
    /// did not exist, reset HEAD, then consume the snapshot.
    pub async fn restore(&self, tools: &ToolExecutor, id: &str) -> Result<RollbackReport> {
        let snapshot = self.load(id).await?;
        let mut report = RollbackReport::default();

        for file in &snapshot.files {
            match file.bytes()? {
                Some(bytes) => {
                    patient(|| tools.write_bytes(&file.path, &bytes)).await?;
                    report.restored.push(file.path.clone());
                }
                None => {
                    if patient(|| tools.delete_file(&file.path)).await? {
                        report.deleted.push(file.path.clone());
                    }
                    remove_empty_parents(tools, &file.path).await?;
                }
            }
        }

        match &snapshot.head {
            Some(head) => {
                if patient(|| tools.git_head()).await?.as_deref() != Some(head.as_str()) {
                    patient(|| tools.git_reset(head)).await?;
                    report.head_reset = true;
                }
            }
            None => debug!(snapshot = id, "Snapshot has no HEAD, skipping reset"),
        }

        self.remove(id).await?;
        info!(
            snapshot = id,
            restored = report.restored.len(),
            deleted = report.deleted.len(),
            head_reset = report.head_reset,
            "Snapshot restored"
        );
        Ok(report)
    }
}

/// Directories created for a new file are removed again if left empty.
pub(crate) async fn remove_empty_parents(tools: &ToolExecutor, path: &str) -> Result<()> {
    let mut current = Path::new(path).parent();
    while let Some(dir) = current {
        let rel = dir.to_string_lossy();
        if rel.is_empty() {
            break;
        }
        if !patient(|| tools.remove_dir(&rel)).await? {
            break;
        }
        current = dir.parent();
    }
    Ok(())
}

/// Run a tool call, waiting out rate-limit rejections a bounded number of
/// times. Rollback must not be abandoned because the budget ran dry.
pub async fn patient<T, F, Fut>(mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(Error::RateLimitExceeded { retry_after, .. }) if attempt < RATE_LIMIT_RETRIES => {
                attempt += 1;
                let wait = retry_after.min(MAX_RATE_LIMIT_WAIT) + Duration::from_millis(10);
                warn!(attempt, ?wait, "Rate limited during recovery, waiting");
                tokio::time::sleep(wait).await;
            }
            other => return other,
        }
    }
}
