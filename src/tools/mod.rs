//! Sandboxed, rate-limited, audited primitive operations.
//!
//! Every public operation on [`ToolExecutor`] goes through one wrapper that
//! (1) takes a slot from the shared rate limiter, (2) runs the operation,
//! (3) appends exactly one audit entry for the outcome. Path arguments are
//! resolved by [`PathGuard`] inside the operation, so rejections are
//! audited like any other failure. One executor is built per process and
//! shared behind an `Arc`, which makes the limiter and audit log global.

pub mod audit;
pub mod database;
pub mod path_guard;
pub mod rate_limit;
pub mod secrets;
pub mod shell;
pub mod stage;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ToolsConfig;
use crate::core::diff::FileDiff;
use crate::git::{GitOps, StatusEntry};
use crate::util::{blocking, blocking_with_timeout};
use crate::{Error, Result};

pub use audit::{AuditLog, AuditLogEntry, RiskClass};
pub use database::{Database, QueryResult};
pub use path_guard::PathGuard;
pub use rate_limit::RateLimiter;
pub use secrets::SecretStore;
pub use shell::{CommandOutput, ShellRunner};
pub use stage::{Overlay, StageSummary, STAGING_DIR};

/// Upper bound on entries returned by `list_files`.
const MAX_LISTED_FILES: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

pub struct ToolExecutor {
    guard: PathGuard,
    limiter: RateLimiter,
    audit: AuditLog,
    shell: ShellRunner,
    database: Option<Database>,
    secrets: SecretStore,
    production: bool,
    command_timeout: Duration,
    max_search_results: usize,
}

impl ToolExecutor {
    /// Build an executor confined to `root`. `audit_file` receives JSON lines.
    pub fn new(root: &Path, config: &ToolsConfig, audit_file: Option<PathBuf>) -> Result<Self> {
        let guard = PathGuard::new(root)?;
        let command_timeout = Duration::from_secs(config.command_timeout_secs);
        let database = config.database_path.as_ref().map(|p| {
            let path = Path::new(p);
            let db = if path.is_absolute() {
                Database::new(path)
            } else {
                Database::new(&guard.root().join(path))
            };
            db.with_timeout(command_timeout)
        });
        Ok(Self {
            limiter: RateLimiter::new(
                config.rate_limit,
                Duration::from_secs(config.rate_window_secs),
            ),
            audit: match audit_file {
                Some(path) => AuditLog::with_file(path),
                None => AuditLog::in_memory(),
            },
            shell: ShellRunner::new(config.max_output_bytes),
            database,
            secrets: SecretStore::new(),
            production: config.production,
            command_timeout,
            max_search_results: config.max_search_results,
            guard,
        })
    }

    pub fn with_secrets(mut self, secrets: SecretStore) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_production(&self) -> bool {
        self.production
    }

    /// Processes spawned by `execute_command` so far.
    pub fn commands_spawned(&self) -> usize {
        self.shell.spawned()
    }

    /// Lexical + symlink check without touching the rate budget.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        self.guard.resolve(path)
    }

    /// Canonical root-relative form of `path`, after the same checks.
    pub fn relative_path(&self, path: &str) -> Result<String> {
        let abs = self.guard.resolve(path)?;
        Ok(self.guard.relative(&abs))
    }

    async fn run<T, F>(&self, operation: &str, risk: RiskClass, details: String, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = match self.limiter.try_acquire() {
            Ok(_) => op.await,
            Err(e) => Err(e),
        };
        let error = result.as_ref().err().map(|e| e.to_string());
        match &error {
            Some(e) => warn!(operation, %details, error = %e, "Tool call failed"),
            None => debug!(operation, %details, "Tool call"),
        }
        self.audit.record(AuditLogEntry {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            risk,
            details,
            success: error.is_none(),
            error,
        });
        result
    }

    // ========== Files ==========

    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.run("read_file", RiskClass::Read, format!("path={}", path), async {
            let abs = self.guard.resolve(path)?;
            Ok(tokio::fs::read_to_string(&abs).await?)
        })
        .await
    }

    /// Raw bytes, or `None` when the file does not exist.
    pub async fn read_bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.run("read_bytes", RiskClass::Read, format!("path={}", path), async {
            let abs = self.guard.resolve(path)?;
            match tokio::fs::read(&abs).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.write_bytes_as("write_file", path, content.as_bytes()).await
    }

    pub async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.write_bytes_as("write_bytes", path, bytes).await
    }

    async fn write_bytes_as(&self, operation: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let details = format!("path={} bytes={}", path, bytes.len());
        self.run(operation, RiskClass::Write, details, async {
            let abs = self.guard.resolve(path)?;
            if let Some(parent) = abs.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&abs, bytes).await?;
            Ok(())
        })
        .await
    }

    /// Replace the single occurrence of `old` with `new`.
    pub async fn edit_file(&self, path: &str, old: &str, new: &str) -> Result<FileDiff> {
        self.run("edit_file", RiskClass::Write, format!("path={}", path), async {
            let abs = self.guard.resolve(path)?;
            if old.is_empty() {
                return Err(Error::Validation("edit_file: old text must not be empty".into()));
            }
            let content = tokio::fs::read_to_string(&abs).await?;
            match content.matches(old).count() {
                0 => {
                    return Err(Error::Validation(format!(
                        "edit_file: text to replace not found in {}",
                        path
                    )))
                }
                1 => {}
                n => {
                    return Err(Error::Validation(format!(
                        "edit_file: text to replace is ambiguous ({} occurrences) in {}",
                        n, path
                    )))
                }
            }
            let updated = content.replacen(old, new, 1);
            tokio::fs::write(&abs, &updated).await?;
            Ok(FileDiff::between(path, &content, &updated))
        })
        .await
    }

    /// Remove a file. Returns whether it existed.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        self.run("delete_file", RiskClass::Write, format!("path={}", path), async {
            let abs = self.guard.resolve(path)?;
            if abs == self.guard.root() {
                return Err(Error::path(path, "refusing to delete the working root"));
            }
            match tokio::fs::metadata(&abs).await {
                Ok(meta) if meta.is_dir() => Err(Error::Validation(format!(
                    "delete_file: {} is a directory",
                    path
                ))),
                Ok(_) => {
                    tokio::fs::remove_file(&abs).await?;
                    Ok(true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Remove a directory only if it is empty. Returns whether it was removed.
    pub async fn remove_dir(&self, path: &str) -> Result<bool> {
        self.run("remove_dir", RiskClass::Write, format!("path={}", path), async {
            let abs = self.guard.resolve(path)?;
            if abs == self.guard.root() {
                return Ok(false);
            }
            match tokio::fs::remove_dir(&abs).await {
                Ok(()) => Ok(true),
                Err(_) => Ok(false),
            }
        })
        .await
    }

    /// Root-relative paths of files under `dir`, honoring ignore files.
    pub async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        self.run("list_files", RiskClass::Read, format!("dir={}", dir), async {
            let abs = self.guard.resolve(if dir.is_empty() { "." } else { dir })?;
            let guard = self.guard.clone();
            blocking(move || {
                let mut files: Vec<String> = walk_files(&abs)
                    .take(MAX_LISTED_FILES)
                    .map(|p| guard.relative(&p))
                    .collect();
                files.sort();
                Ok(files)
            })
            .await
        })
        .await
    }

    /// Lines matching the regex `pattern`, across all non-ignored files.
    pub async fn search_files(&self, pattern: &str) -> Result<Vec<SearchMatch>> {
        let limit = self.max_search_results;
        self.run("search_files", RiskClass::Read, format!("pattern={}", pattern), async {
            let re = regex::Regex::new(pattern)
                .map_err(|e| Error::Validation(format!("invalid search pattern: {}", e)))?;
            let guard = self.guard.clone();
            blocking(move || {
                let mut matches = Vec::new();
                for path in walk_files(guard.root()) {
                    let Ok(content) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    for (i, line) in content.lines().enumerate() {
                        if re.is_match(line) {
                            matches.push(SearchMatch {
                                path: guard.relative(&path),
                                line: i + 1,
                                text: line.trim().chars().take(240).collect(),
                            });
                            if matches.len() >= limit {
                                return Ok(matches);
                            }
                        }
                    }
                }
                Ok(matches)
            })
            .await
        })
        .await
    }

    /// Copy the working tree into `dest` (a directory directly under
    /// [`STAGING_DIR`]) and apply `overlay` to the copy.
    pub async fn stage_tree(&self, dest: &str, overlay: &Overlay) -> Result<StageSummary> {
        let details = format!("dest={} overlay={}", dest, overlay.len());
        self.run("stage_tree", RiskClass::Write, details, async {
            let abs = self.stage_dir(dest)?;
            if tokio::fs::metadata(&abs).await.is_ok() {
                return Err(Error::Validation(format!("stage_tree: {} already exists", dest)));
            }
            let mut cleaned = Vec::with_capacity(overlay.len());
            for (path, content) in overlay {
                let rel = self.guard.relative(&self.guard.resolve(path)?);
                if rel.is_empty() || rel.starts_with(".devpilot") {
                    return Err(Error::path(path, "cannot be staged"));
                }
                cleaned.push((rel, content.clone()));
            }
            let root = self.guard.root().to_path_buf();
            blocking(move || {
                let files: Vec<PathBuf> = walk_files(&root).take(stage::MAX_STAGED_FILES + 1).collect();
                stage::build(&root, &abs, files, &cleaned)
            })
            .await
        })
        .await
    }

    /// Remove a stage created by [`ToolExecutor::stage_tree`], links included.
    pub async fn discard_stage(&self, dest: &str) -> Result<bool> {
        self.run("discard_stage", RiskClass::Write, format!("dest={}", dest), async {
            let abs = self.stage_dir(dest)?;
            match tokio::fs::remove_dir_all(&abs).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    fn stage_dir(&self, dest: &str) -> Result<PathBuf> {
        let abs = self.guard.resolve(dest)?;
        if !stage::is_stage_path(&self.guard.relative(&abs)) {
            return Err(Error::path(dest, format!("is not a directory directly under {}", STAGING_DIR)));
        }
        Ok(abs)
    }

    // ========== Processes ==========

    pub async fn execute_command(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        self.execute_command_in(command, "", timeout).await
    }

    /// Run `command` with `dir` (root-relative, empty for the root) as its
    /// working directory.
    pub async fn execute_command_in(&self, command: &str, dir: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        let timeout = timeout.unwrap_or(self.command_timeout);
        let details = if dir.is_empty() {
            format!("command={} timeout={:?}", command, timeout)
        } else {
            format!("command={} dir={} timeout={:?}", command, dir, timeout)
        };
        self.run("execute_command", RiskClass::Shell, details, async {
            let cwd = if dir.is_empty() {
                self.guard.root().to_path_buf()
            } else {
                self.guard.resolve(dir)?
            };
            self.shell.run(command, &cwd, timeout).await
        })
        .await
    }

    pub async fn query_database(&self, query: &str) -> Result<QueryResult> {
        let details = format!("query={} production={}", query, self.production);
        self.run("query_database", RiskClass::Database, details, async {
            database::screen_query(query, self.production)?;
            let db = self
                .database
                .as_ref()
                .ok_or_else(|| Error::Validation("no database configured".into()))?;
            db.query(query).await
        })
        .await
    }

    // ========== Version control ==========
    // git2 calls are blocking and share the command timeout.

    pub async fn git_status(&self) -> Result<Vec<StatusEntry>> {
        let (root, limit) = (self.root().to_path_buf(), self.command_timeout);
        self.run("git_status", RiskClass::Vcs, String::new(), async move {
            blocking_with_timeout(limit, move || GitOps::new(&root)?.status()).await
        })
        .await
    }

    /// Stage everything and commit. Returns the commit id.
    pub async fn git_commit(&self, message: &str) -> Result<String> {
        let (root, limit) = (self.root().to_path_buf(), self.command_timeout);
        let msg = message.to_string();
        self.run("git_commit", RiskClass::Vcs, format!("message={}", message), async move {
            blocking_with_timeout(limit, move || GitOps::new(&root)?.commit_all(&msg)).await
        })
        .await
    }

    pub async fn create_branch(&self, name: &str) -> Result<String> {
        let (root, limit) = (self.root().to_path_buf(), self.command_timeout);
        let branch = name.to_string();
        self.run("create_branch", RiskClass::Vcs, format!("branch={}", name), async move {
            blocking_with_timeout(limit, move || GitOps::new(&root)?.create_branch(&branch)).await
        })
        .await
    }

    /// HEAD commit id; `None` when the root is not a repository or unborn.
    pub async fn git_head(&self) -> Result<Option<String>> {
        let (root, limit) = (self.root().to_path_buf(), self.command_timeout);
        self.run("git_head", RiskClass::Vcs, String::new(), async move {
            blocking_with_timeout(limit, move || match GitOps::discover(&root) {
                Some(git) => git.head_commit(),
                None => Ok(None),
            })
            .await
        })
        .await
    }

    /// Move HEAD and index to `commit` without touching files.
    pub async fn git_reset(&self, commit: &str) -> Result<()> {
        let (root, limit) = (self.root().to_path_buf(), self.command_timeout);
        let target = commit.to_string();
        self.run("git_reset", RiskClass::Vcs, format!("commit={}", commit), async move {
            blocking_with_timeout(limit, move || GitOps::new(&root)?.reset_mixed(&target)).await
        })
        .await
    }

    // ========== Secrets ==========

    pub async fn get_secret(&self, key: &str) -> Result<String> {
        self.run("get_secret", RiskClass::Secret, format!("key={}", key), async {
            self.secrets
                .get(key)
                .ok_or_else(|| Error::SecretNotFound(key.to_string()))
        })
        .await
    }

    pub async fn has_secret(&self, key: &str) -> Result<bool> {
        self.run("has_secret", RiskClass::Secret, format!("key={}", key), async {
            Ok(self.secrets.contains(key))
        })
        .await
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("root", &self.guard.root())
            .field("production", &self.production)
            .field("rate_limit", &self.limiter.limit())
            .finish()
    }
}

fn walk_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    ignore::WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build()
        .flatten()
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.into_path())
}
