//! Generated file changes and validation results.

use serde::{Deserialize, Serialize};

use crate::core::diff::FileDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAction::Create => write!(f, "create"),
            FileAction::Modify => write!(f, "modify"),
            FileAction::Delete => write!(f, "delete"),
        }
    }
}

/// An import found in generated content and what it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRef {
    pub specifier: String,
    /// Repository-relative path of the target, when it could be found.
    pub resolved: Option<String>,
    /// Package import rather than a path into the repository.
    pub external: bool,
}

/// One proposed file change.
///
/// The diff is private and recomputed from `original`/`content` on every
/// change, including after deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "FileRecord")]
pub struct GeneratedFile {
    pub path: String,
    pub language: String,
    pub original: Option<String>,
    content: String,
    action: FileAction,
    pub rationale: String,
    pub imports: Vec<ImportRef>,
    pub subtask_ids: Vec<String>,
    diff: FileDiff,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord {
    path: String,
    #[serde(default)]
    original: Option<String>,
    #[serde(default)]
    content: String,
    action: FileAction,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    imports: Vec<ImportRef>,
    #[serde(default)]
    subtask_ids: Vec<String>,
}

impl From<FileRecord> for GeneratedFile {
    fn from(r: FileRecord) -> Self {
        let mut file = match r.action {
            FileAction::Delete => GeneratedFile::delete(&r.path, r.original.unwrap_or_default(), &r.rationale),
            _ => GeneratedFile::new(&r.path, r.original, r.content, &r.rationale),
        };
        file.imports = r.imports;
        file.subtask_ids = r.subtask_ids;
        file
    }
}

impl GeneratedFile {
    /// A create (no original) or modify (original present) change.
    pub fn new(path: &str, original: Option<String>, content: String, rationale: &str) -> Self {
        let action = if original.is_some() {
            FileAction::Modify
        } else {
            FileAction::Create
        };
        let diff = FileDiff::between(path, original.as_deref().unwrap_or(""), &content);
        Self {
            path: path.to_string(),
            language: language_for(path).to_string(),
            original,
            content,
            action,
            rationale: rationale.to_string(),
            imports: Vec::new(),
            subtask_ids: Vec::new(),
            diff,
        }
    }

    pub fn delete(path: &str, original: String, rationale: &str) -> Self {
        let diff = FileDiff::between(path, &original, "");
        Self {
            path: path.to_string(),
            language: language_for(path).to_string(),
            original: Some(original),
            content: String::new(),
            action: FileAction::Delete,
            rationale: rationale.to_string(),
            imports: Vec::new(),
            subtask_ids: Vec::new(),
            diff,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn action(&self) -> FileAction {
        self.action
    }

    pub fn diff(&self) -> &FileDiff {
        &self.diff
    }

    /// Replace the new content (e.g. after a heal patch); the diff follows.
    pub fn set_content(&mut self, content: String) {
        if self.action == FileAction::Delete {
            self.action = FileAction::Modify;
        }
        self.diff = FileDiff::between(&self.path, self.original.as_deref().unwrap_or(""), &content);
        self.content = content;
    }
}

/// Detect a language name from a file extension.
pub fn language_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "sql" => "sql",
        "css" | "scss" => "css",
        "html" => "html",
        "json" => "json",
        "md" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "sh" => "shell",
        _ => "text",
    }
}

/// A file that could not be generated; siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFailure {
    pub subtask_id: String,
    pub path: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub line: Option<usize>,
    pub message: String,
    /// Which check or tool produced it.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileDiagnostics {
    pub path: String,
    pub errors: usize,
    pub warnings: usize,
    pub messages: Vec<Diagnostic>,
}

impl FileDiagnostics {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
        }
        self.messages.push(diagnostic);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub command: Option<String>,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub success: bool,
    /// No test command configured; counts are zero and success is true.
    pub skipped: bool,
    pub output_tail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub files: Vec<FileDiagnostics>,
    pub tests: TestReport,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub safe: bool,
    pub warnings: Vec<String>,
    pub heal_attempts: u32,
}
