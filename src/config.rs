use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Upper bounds accepted for `[ai]` retry settings.
pub const MAX_AI_RETRIES: u32 = 10;
pub const MAX_AI_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Where task records, snapshots and the audit log live.
    pub state_dir: Option<String>,
    pub tools: ToolsConfig,
    pub ai: AiConfig,
    pub planner: PlannerConfig,
    pub generator: GeneratorConfig,
    pub validator: ValidatorConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub rate_limit: usize,
    pub rate_window_secs: u64,
    pub command_timeout_secs: u64,
    pub max_output_bytes: usize,
    /// Production mode blocks destructive SQL.
    pub production: bool,
    pub database_path: Option<String>,
    pub audit_to_file: bool,
    pub max_search_results: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            rate_limit: 100,
            rate_window_secs: 60,
            command_timeout_secs: 30,
            max_output_bytes: 1024 * 1024,
            production: false,
            database_path: None,
            audit_to_file: true,
            max_search_results: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Http,
    Claude,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub backend: BackendKind,
    pub base_url: String,
    pub model: String,
    /// Secret key holding the API token; resolved through the tool layer.
    pub api_key_secret: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Http,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_secret: "DEVPILOT_AI_API_KEY".to_string(),
            timeout_secs: 120,
            max_retries: 2,
            backoff_ms: 500,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub pattern_threshold: f64,
    /// JSON file with extra patterns; built-in patterns are used otherwise.
    pub pattern_library: Option<String>,
    pub max_subtasks: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            pattern_threshold: 0.35,
            pattern_library: None,
            max_subtasks: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub concurrency: usize,
    pub reuse_threshold: f64,
    pub context_chars: usize,
    pub context_files: usize,
    pub schema_files: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            reuse_threshold: 0.85,
            context_chars: 48_000,
            context_files: 12,
            schema_files: vec![
                "schema.sql".to_string(),
                "schema.prisma".to_string(),
                "shared/schema.ts".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_heal_attempts: u32,
    pub max_errors: usize,
    pub max_warnings: usize,
    pub test_command: Option<String>,
    pub test_timeout_secs: u64,
    /// Language name to lint command; `{file}` is replaced with the staged path.
    pub lint_commands: BTreeMap<String, String>,
    /// Re-run tests after applying and roll back on failure.
    pub verify_after_apply: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_heal_attempts: 3,
            max_errors: 0,
            max_warnings: 25,
            test_command: None,
            test_timeout_secs: 300,
            lint_commands: BTreeMap::new(),
            verify_after_apply: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl Config {
    pub fn devpilot_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".devpilot"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::devpilot_dir()?.join("devpilot.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::devpilot_dir(),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            backend = ?config.ai.backend,
            rate_limit = config.tools.rate_limit,
            production = config.tools.production,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::devpilot_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tools.rate_limit == 0 {
            return Err(Error::Validation("tools.rate_limit must be > 0".into()));
        }
        if self.generator.concurrency == 0 {
            return Err(Error::Validation("generator.concurrency must be > 0".into()));
        }
        if self.ai.max_retries > MAX_AI_RETRIES {
            return Err(Error::Validation(format!("ai.max_retries must be <= {}", MAX_AI_RETRIES)));
        }
        if self.ai.backoff_ms > MAX_AI_BACKOFF_MS {
            return Err(Error::Validation(format!("ai.backoff_ms must be <= {}", MAX_AI_BACKOFF_MS)));
        }
        if !(0.0..=1.0).contains(&self.generator.reuse_threshold)
            || !(0.0..=1.0).contains(&self.planner.pattern_threshold)
        {
            return Err(Error::Validation("similarity thresholds must be within 0..=1".into()));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
