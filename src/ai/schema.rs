//! Typed parsing of completion payloads.
//!
//! Completions are expected to carry one JSON document, optionally wrapped
//! in a Markdown code fence or surrounded by prose. Each stage has its own
//! payload type; semantic checks run right after deserialization so later
//! stages only see validated values.

use std::collections::HashSet;

use serde::Deserialize;

use crate::core::plan::{Subtask, SubtaskType};
use crate::{Error, Result};

pub const MIN_ESTIMATE_MINUTES: u32 = 1;
pub const MAX_ESTIMATE_MINUTES: u32 = 480;

/// Locate the JSON document inside a completion.
pub fn extract_json(text: &str) -> Result<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip the language tag on the fence line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return Ok(inner);
            }
        }
    }

    let open = trimmed
        .find(|c| c == '{' || c == '[')
        .ok_or_else(|| invalid("no JSON document in completion"))?;
    let close_char = if trimmed[open..].starts_with('{') { '}' } else { ']' };
    let close = trimmed
        .rfind(close_char)
        .filter(|&i| i > open)
        .ok_or_else(|| invalid("unterminated JSON document in completion"))?;
    Ok(&trimmed[open..=close])
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::AiGeneration(msg.into())
}

fn parse<'a, T: Deserialize<'a>>(text: &'a str, what: &str) -> Result<T> {
    let json = extract_json(text)?;
    serde_json::from_str(json).map_err(|e| invalid(format!("malformed {} payload: {}", what, e)))
}

// ========== Decomposition ==========

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubtask {
    id: String,
    #[serde(alias = "title")]
    description: String,
    #[serde(rename = "type", alias = "kind")]
    kind: String,
    #[serde(default, alias = "dependencies", alias = "depends_on")]
    depends_on: Vec<String>,
    #[serde(alias = "estimated_minutes", alias = "estimate")]
    estimated_minutes: u32,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DecompositionPayload {
    Wrapped { subtasks: Vec<RawSubtask> },
    Bare(Vec<RawSubtask>),
}

fn parse_kind(kind: &str) -> Option<SubtaskType> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "code" | "implementation" => Some(SubtaskType::Code),
        "test" | "tests" => Some(SubtaskType::Test),
        "doc" | "docs" | "documentation" => Some(SubtaskType::Doc),
        "infra" | "infrastructure" | "config" => Some(SubtaskType::Infra),
        _ => None,
    }
}

/// Parse and validate an ordered subtask list.
///
/// Rejects an empty list, more than `max_subtasks` entries, duplicate ids,
/// unknown types, dependencies on anything but an earlier subtask, and
/// estimates outside 1..=480 minutes.
pub fn parse_subtasks(text: &str, max_subtasks: usize) -> Result<Vec<Subtask>> {
    let raw = match parse::<DecompositionPayload>(text, "decomposition")? {
        DecompositionPayload::Wrapped { subtasks } => subtasks,
        DecompositionPayload::Bare(subtasks) => subtasks,
    };
    if raw.is_empty() {
        return Err(invalid("decomposition contained no subtasks"));
    }
    if raw.len() > max_subtasks {
        return Err(invalid(format!(
            "decomposition has {} subtasks, limit is {}",
            raw.len(),
            max_subtasks
        )));
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut subtasks = Vec::with_capacity(raw.len());
    for r in raw {
        let id = r.id.trim().to_string();
        if id.is_empty() {
            return Err(invalid("subtask with empty id"));
        }
        if seen.contains(&id) {
            return Err(invalid(format!("duplicate subtask id {}", id)));
        }
        if r.description.trim().is_empty() {
            return Err(invalid(format!("subtask {} has no description", id)));
        }
        let kind = parse_kind(&r.kind)
            .ok_or_else(|| invalid(format!("subtask {} has unknown type '{}'", id, r.kind)))?;
        if !(MIN_ESTIMATE_MINUTES..=MAX_ESTIMATE_MINUTES).contains(&r.estimated_minutes) {
            return Err(invalid(format!(
                "subtask {} estimate {} is outside {}..={} minutes",
                id, r.estimated_minutes, MIN_ESTIMATE_MINUTES, MAX_ESTIMATE_MINUTES
            )));
        }
        let mut depends_on = Vec::with_capacity(r.depends_on.len());
        for dep in r.depends_on {
            let dep = dep.trim().to_string();
            if !seen.contains(&dep) {
                return Err(invalid(format!(
                    "subtask {} depends on {}, which is not an earlier subtask",
                    id, dep
                )));
            }
            if !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }
        let files = r
            .files
            .into_iter()
            .map(|f| f.trim().trim_start_matches("./").to_string())
            .filter(|f| !f.is_empty())
            .collect();

        seen.insert(id.clone());
        subtasks.push(Subtask {
            id,
            description: r.description.trim().to_string(),
            kind,
            depends_on,
            estimated_minutes: r.estimated_minutes,
            files,
        });
    }
    Ok(subtasks)
}

// ========== Generation ==========

/// One file proposed by a generation completion.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileContent {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub rationale: String,
    /// Remove the file instead of writing `content`.
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GenerationPayload {
    Many { files: Vec<FileContent> },
    One(FileContent),
}

/// Parse a generation completion into one or more file contents.
pub fn parse_generation(text: &str) -> Result<Vec<FileContent>> {
    let files = match parse::<GenerationPayload>(text, "generation")? {
        GenerationPayload::Many { files } => files,
        GenerationPayload::One(file) => vec![file],
    };
    if files.is_empty() {
        return Err(invalid("generation returned no files"));
    }
    if files.iter().any(|f| !f.delete && f.content.trim().is_empty()) {
        return Err(invalid("generation returned an empty file"));
    }
    Ok(files)
}

// ========== Heal ==========

/// Full replacement content for one file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct HealResponse {
    #[serde(default)]
    patches: Vec<FilePatch>,
}

pub fn parse_heal(text: &str) -> Result<Vec<FilePatch>> {
    let response: HealResponse = parse(text, "heal")?;
    if response.patches.is_empty() {
        return Err(invalid("heal response contained no patches"));
    }
    Ok(response.patches)
}
