//! Durable task records with optimistic concurrency.
//!
//! One JSON file per task under `<state_dir>/tasks/`. Every write bumps the
//! record's version; a write carrying a stale version is rejected with
//! `VersionConflict` and leaves the stored record untouched.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::task::{Task, TaskId};
use crate::util::{blocking, write_atomic};
use crate::{Error, Result};

pub struct TaskStore {
    dir: PathBuf,
    /// Serializes compare-and-swap so two writers cannot both pass the check.
    write_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("tasks"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read(&self, id: TaskId) -> Result<Option<Task>> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, task: &Task) -> Result<()> {
        let path = self.path_for(task.id);
        let json = serde_json::to_vec_pretty(task)?;
        blocking(move || write_atomic(&path, &json)).await
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.read(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// All stored tasks, oldest first. Unreadable records are skipped.
    pub async fn list(&self) -> Result<Vec<Task>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<Task>(&bytes).map_err(Error::from));
            match parsed {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable task record"),
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Store a new task. Fails if the id is already taken.
    pub async fn insert(&self, task: &mut Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.read(task.id).await? {
            return Err(Error::VersionConflict {
                task: task.id.to_string(),
                expected: 0,
                found: existing.version,
            });
        }
        task.version = 1;
        self.write(task).await?;
        debug!(task = %task.id, "Task inserted");
        Ok(())
    }

    /// Compare-and-swap write. On success `task.version` is the new version.
    pub async fn save(&self, task: &mut Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let stored = self
            .read(task.id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task.id.to_string()))?;
        if stored.version != task.version {
            return Err(Error::VersionConflict {
                task: task.id.to_string(),
                expected: task.version,
                found: stored.version,
            });
        }
        task.version += 1;
        if let Err(e) = self.write(task).await {
            task.version -= 1;
            return Err(e);
        }
        debug!(task = %task.id, version = task.version, status = %task.status, "Task saved");
        Ok(())
    }

    /// Load the latest record, apply `f`, and save it in one critical section.
    /// Nothing is written when `f` fails.
    pub async fn update<F>(&self, id: TaskId, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut task = self
            .read(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        f(&mut task)?;
        task.version += 1;
        self.write(&task).await?;
        debug!(task = %task.id, version = task.version, status = %task.status, "Task updated");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskStatus;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let mut task = Task::new("alice", "Add a health check endpoint", false);
        store.insert(&mut task).await.unwrap();
        assert_eq!(task.version, 1);

        let loaded = store.get(task.id).await.unwrap();
        assert_eq!(loaded.prompt, task.prompt);
        assert_eq!(loaded.version, 1);
        assert!(store.insert(&mut task).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_task() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        assert!(matches!(store.get(TaskId::new()).await, Err(Error::TaskNotFound(_))));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let mut task = Task::new("alice", "x", false);
        store.insert(&mut task).await.unwrap();

        let mut first = store.get(task.id).await.unwrap();
        let mut second = first.clone();
        first.transition(TaskStatus::Decomposing).unwrap();
        store.save(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        second.fail("cancelled").unwrap();
        let err = store.save(&mut second).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { expected: 1, found: 2, .. }));
        assert_eq!(second.version, 1);
        assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Decomposing);
    }

    #[tokio::test]
    async fn test_update_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let mut task = Task::new("alice", "x", false);
        store.insert(&mut task).await.unwrap();

        let err = store
            .update(task.id, |t| t.transition(TaskStatus::Applying))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApprovalState { .. }));
        let stored = store.get(task.id).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_updates_all_apply() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::new(dir.path()));
        let mut task = Task::new("alice", "x", false);
        store.insert(&mut task).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = task.id;
                tokio::spawn(async move {
                    store
                        .update(id, |t| {
                            t.generation_failures.clear();
                            Ok(())
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(task.id).await.unwrap().version, 9);
    }

    #[tokio::test]
    async fn test_list_survives_reopen_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let mut a = Task::new("a", "first", false);
        let mut b = Task::new("b", "second", false);
        store.insert(&mut a).await.unwrap();
        store.insert(&mut b).await.unwrap();
        std::fs::write(store.dir().join("junk.json"), "{").unwrap();

        let reopened = TaskStore::new(dir.path());
        let tasks = reopened.list().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].prompt, "first");
    }
}
