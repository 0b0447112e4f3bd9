//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A completion backend scripted per pipeline stage
//! - Wiring an orchestrator over both

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use devpilot::ai::{AiClient, CompletionBackend, CompletionRequest, CompletionResponse, Purpose};
use devpilot::config::{AiConfig, Config, GeneratorConfig, ToolsConfig};
use devpilot::git::GitOps;
use devpilot::tools::ToolExecutor;
use devpilot::Orchestrator;

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Write raw bytes and commit them.
    pub fn commit_bytes(&self, filename: &str, bytes: &[u8], message: &str) -> String {
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent");
        }
        std::fs::write(&file_path, bytes).expect("Failed to write file");
        git(&self.path, &["add", filename]);
        git(&self.path, &["commit", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        GitOps::new(&self.path)
            .and_then(|g| g.head_commit())
            .expect("Failed to read HEAD")
            .expect("Repository has no HEAD")
    }

    pub fn read(&self, filename: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path.join(filename)).ok()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Completion backend that answers each [`Purpose`] from its own queue.
///
/// The last reply in a queue is repeated once the others are used up.
/// Decomposition can be held open to observe a task mid-pipeline.
pub struct ScriptedAi {
    replies: Mutex<HashMap<Purpose, VecDeque<String>>>,
    calls: Mutex<Vec<Purpose>>,
    hold_decompose: AtomicBool,
    /// Notified when a held decomposition call starts.
    pub entered: Notify,
    /// Notify to let a held decomposition call finish.
    pub release: Notify,
}

impl ScriptedAi {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hold_decompose: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn reply(self, purpose: Purpose, text: impl Into<String>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(text.into());
        self
    }

    pub fn holding_decompose(self) -> Self {
        self.hold_decompose.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self, purpose: Purpose) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| **p == purpose).count()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedAi {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> devpilot::Result<CompletionResponse> {
        self.calls.lock().unwrap().push(request.purpose);
        if request.purpose == Purpose::Decompose && self.hold_decompose.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        let text = {
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.entry(request.purpose).or_default();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };
        Ok(CompletionResponse {
            text: text.unwrap_or_else(|| "{}".to_string()),
            model: "scripted".into(),
        })
    }
}

/// Config with templates disabled, so every file comes from the backend.
pub fn test_config() -> Config {
    Config {
        generator: GeneratorConfig {
            reuse_threshold: 1.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// An orchestrator over `repo` with its own state directory.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub ai: Arc<ScriptedAi>,
    pub state_dir: TempDir,
}

impl Harness {
    pub fn new(repo: &TestRepo, ai: ScriptedAi) -> Self {
        Self::with_config(repo, ai, test_config())
    }

    pub fn with_config(repo: &TestRepo, ai: ScriptedAi, config: Config) -> Self {
        let state_dir = TempDir::new().expect("Failed to create state directory");
        let tools = Arc::new(ToolExecutor::new(&repo.path, &config.tools, None).expect("Failed to build tools"));
        let ai = Arc::new(ai);
        let client = AiClient::new(
            ai.clone(),
            &AiConfig {
                max_retries: 0,
                ..Default::default()
            },
        );
        let orchestrator = Orchestrator::new(tools, client, &config, state_dir.path());
        Self {
            orchestrator,
            ai,
            state_dir,
        }
    }
}

/// Tool layer over `root` with the given limits.
pub fn tools(root: &Path, config: ToolsConfig) -> ToolExecutor {
    ToolExecutor::new(root, &config, None).expect("Failed to build tools")
}

/// One code subtask writing `file`, followed by a docs subtask.
pub fn plan_for(file: &str) -> String {
    format!(
        r#"{{"subtasks":[
  {{"id":"s1","description":"Implement the change","type":"code","estimatedMinutes":20,"files":["{}"]}},
  {{"id":"s2","description":"Document the change","type":"doc","dependsOn":["s1"],"estimatedMinutes":10}}
]}}"#,
        file
    )
}

/// A generation reply carrying `content` for `path`.
pub fn file_reply(path: &str, content: &str) -> String {
    serde_json::json!({
        "files": [{ "path": path, "content": content, "rationale": "requested change" }]
    })
    .to_string()
}

pub const HEALTH_TS: &str = "export function healthCheck(): { status: string } {\n  return { status: \"ok\" };\n}\n";
