//! Bounded repository context for generation prompts.

use std::collections::HashSet;

use tracing::debug;

use crate::config::GeneratorConfig;
use crate::planning::patterns::tokens;
use crate::tools::ToolExecutor;
use crate::Result;

/// Paths listed verbatim in a prompt before the index is elided.
const MAX_INDEX_LINES: usize = 400;

#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    /// Every non-ignored file in the repository, sorted.
    pub index: Vec<String>,
    /// Loaded files, schema files first.
    pub files: Vec<(String, String)>,
    pub chars: usize,
}

impl RepoContext {
    pub fn known_paths(&self) -> HashSet<String> {
        self.index.iter().cloned().collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.binary_search_by(|p| p.as_str().cmp(path)).is_ok()
    }

    pub fn content(&self, path: &str) -> Option<&str> {
        self.files.iter().find(|(p, _)| p == path).map(|(_, c)| c.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Repository files:\n");
        for path in self.index.iter().take(MAX_INDEX_LINES) {
            out.push_str(path);
            out.push('\n');
        }
        if self.index.len() > MAX_INDEX_LINES {
            out.push_str(&format!("... {} more\n", self.index.len() - MAX_INDEX_LINES));
        }
        for (path, content) in &self.files {
            out.push_str(&format!("\n--- {} ---\n{}\n", path, content));
        }
        out
    }
}

/// How strongly a path relates to the request, by shared words.
fn relevance(path: &str, keywords: &HashSet<String>) -> usize {
    tokens(path).intersection(keywords).count()
}

fn is_schema(path: &str, schema_files: &[String]) -> bool {
    schema_files
        .iter()
        .any(|name| path == name.as_str() || path.ends_with(&format!("/{}", name)))
}

/// Load the file index plus schema files, declared targets and the files
/// most relevant to `prompt`, stopping at the file and character budgets.
pub async fn load(
    tools: &ToolExecutor,
    prompt: &str,
    targets: &[String],
    config: &GeneratorConfig,
) -> Result<RepoContext> {
    let index = tools.list_files("").await?;
    let keywords = tokens(prompt);

    let mut wanted: Vec<&String> = index.iter().filter(|p| is_schema(p, &config.schema_files)).collect();
    wanted.extend(index.iter().filter(|p| targets.contains(*p)));

    let mut ranked: Vec<(&String, usize)> = index
        .iter()
        .map(|p| (p, relevance(p, &keywords)))
        .filter(|(_, score)| *score > 0)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    wanted.extend(ranked.into_iter().map(|(p, _)| p));

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    let mut chars = 0usize;
    for path in wanted {
        if files.len() >= config.context_files || !seen.insert(path.clone()) {
            continue;
        }
        let Ok(content) = tools.read_file(path).await else {
            continue;
        };
        let len = content.chars().count();
        if chars + len > config.context_chars {
            debug!(path = %path, len, "Context budget reached, skipping file");
            continue;
        }
        chars += len;
        files.push((path.clone(), content));
    }

    debug!(indexed = index.len(), loaded = files.len(), chars, "Repository context loaded");
    Ok(RepoContext { index, files, chars })
}
