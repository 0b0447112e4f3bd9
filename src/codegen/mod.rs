//! Multi-file code synthesis over a planned decomposition.
//!
//! Tracks run in order; the file-producing subtasks of one track run
//! concurrently, bounded by a semaphore. A subtask whose description closely
//! matches a pattern template is adapted from the template without an AI
//! call. Failures are collected per file and never abort siblings.

pub mod context;
pub mod imports;

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::ai::{schema, AiClient, Purpose};
use crate::config::GeneratorConfig;
use crate::core::files::{language_for, FileAction, GeneratedFile, GenerationFailure};
use crate::core::plan::{Decomposition, Subtask};
use crate::planning::patterns::{PatternLibrary, PatternRegistry};
use crate::tools::ToolExecutor;
use crate::util::truncate_chars;
use crate::{Error, Result};

pub use context::RepoContext;

const GENERATE_SYSTEM: &str = "You write production code for a TypeScript/Node community platform. \
Return complete file contents, never fragments or diffs. Reply with JSON only: \
{\"files\":[{\"path\":\"relative/path.ts\",\"content\":\"...\",\"rationale\":\"why\"}]}. \
To remove a file use {\"path\":\"...\",\"delete\":true,\"rationale\":\"why\"}. \
Read secrets from the environment; never hardcode credentials.";

/// Characters of each earlier generated file shown to dependent subtasks.
const PRIOR_FILE_CHARS: usize = 4_000;

#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub files: Vec<GeneratedFile>,
    pub failures: Vec<GenerationFailure>,
    /// Files produced from pattern templates.
    pub reused_templates: usize,
}

/// A file a work item wants written, or removed when `content` is `None`.
#[derive(Debug)]
struct Proposal {
    path: String,
    content: Option<String>,
    rationale: String,
    from_template: bool,
}

struct WorkItem<'a> {
    order: usize,
    subtask: &'a Subtask,
    target: Option<&'a str>,
}

pub struct CodeGenerator {
    tools: Arc<ToolExecutor>,
    ai: AiClient,
    patterns: Arc<PatternRegistry>,
    config: GeneratorConfig,
}

impl CodeGenerator {
    pub fn new(
        tools: Arc<ToolExecutor>,
        ai: AiClient,
        patterns: Arc<PatternRegistry>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            tools,
            ai,
            patterns,
            config,
        }
    }

    /// Generate file changes for every code and test subtask.
    ///
    /// # Errors
    /// `AiGeneration` when not a single file could be produced, `Cancelled`
    /// when `cancel` fires, or a tool error while loading context.
    #[instrument(skip_all, fields(subtasks = decomposition.subtasks.len()))]
    pub async fn generate(
        &self,
        prompt: &str,
        decomposition: &Decomposition,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutput> {
        let targets: Vec<String> = decomposition
            .subtasks
            .iter()
            .flat_map(|s| s.files.iter().cloned())
            .collect();
        let ctx = context::load(&self.tools, prompt, &targets, &self.config).await?;
        let library = self.patterns.get().await?;
        let semaphore = Semaphore::new(self.config.concurrency.max(1));
        let mut output = GenerationOutput::default();

        for (track_index, track) in decomposition.tracks_of_subtasks().into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let items = work_items(&track);
            if items.is_empty() {
                continue;
            }
            debug!(track = track_index, items = items.len(), "Generating track");

            let mut results = {
                let prior = &output.files;
                let mut pending: FuturesUnordered<_> = items
                    .iter()
                    .map(|item| {
                        let semaphore = &semaphore;
                        let ctx = &ctx;
                        let library = &library;
                        async move {
                            let outcome = match semaphore.acquire().await {
                                Ok(_permit) => self.generate_item(prompt, item, ctx, library, prior).await,
                                Err(e) => Err(e.to_string()),
                            };
                            (item.order, item.subtask.id.clone(), item.target.map(String::from), outcome)
                        }
                    })
                    .collect();

                let mut results = Vec::with_capacity(items.len());
                loop {
                    tokio::select! {
                        next = pending.next() => match next {
                            Some(result) => results.push(result),
                            None => break,
                        },
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                results
            };
            results.sort_by_key(|r| r.0);

            for (_, subtask_id, target, outcome) in results {
                match outcome {
                    Ok(proposals) => {
                        for proposal in proposals {
                            let path = proposal.path.clone();
                            if let Err(e) = self.merge(&mut output, &subtask_id, proposal).await {
                                output.failures.push(failure(&subtask_id, Some(path), e));
                            }
                        }
                    }
                    Err(e) => output.failures.push(failure(&subtask_id, target, e)),
                }
            }
        }

        let mut known = ctx.known_paths();
        for file in &output.files {
            if file.action() == FileAction::Delete {
                known.remove(&file.path);
            } else {
                known.insert(file.path.clone());
            }
        }
        for file in output.files.iter_mut().filter(|f| f.action() != FileAction::Delete) {
            file.imports = imports::resolve_imports(&file.path, &file.language, file.content(), &known);
        }

        if output.files.is_empty() {
            let detail = output
                .failures
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_else(|| "no code or test subtasks".to_string());
            return Err(Error::AiGeneration(format!("no file could be generated: {}", detail)));
        }

        info!(
            files = output.files.len(),
            failures = output.failures.len(),
            reused = output.reused_templates,
            "Generation finished"
        );
        Ok(output)
    }

    async fn generate_item(
        &self,
        prompt: &str,
        item: &WorkItem<'_>,
        ctx: &RepoContext,
        library: &PatternLibrary,
        prior: &[GeneratedFile],
    ) -> std::result::Result<Vec<Proposal>, String> {
        let subtask = item.subtask;
        if let Some((pattern, template, score)) =
            library.best_template(&subtask.description, self.config.reuse_threshold)
        {
            let path = item.target.unwrap_or(&template.path);
            if language_for(path) == language_for(&template.path) {
                debug!(subtask = %subtask.id, pattern = %pattern.name, score, "Adapting template");
                return Ok(vec![Proposal {
                    path: path.to_string(),
                    content: Some(template.adapt(&pattern.name, &subtask.description)),
                    rationale: format!(
                        "{} (adapted from pattern {}, similarity {:.2})",
                        subtask.description, pattern.name, score
                    ),
                    from_template: true,
                }]);
            }
        }

        let existing = item.target.and_then(|p| {
            prior
                .iter()
                .find(|f| f.path == p)
                .map(|f| f.content())
                .or_else(|| ctx.content(p))
        });
        let request = self.ai.request(
            Purpose::Generate,
            GENERATE_SYSTEM,
            generation_prompt(prompt, subtask, item.target, existing, ctx, prior),
        );
        let response = self.ai.complete(&request).await.map_err(|e| e.to_string())?;
        let files = schema::parse_generation(&response.text).map_err(|e| e.to_string())?;

        match item.target {
            Some(target) => {
                let chosen = files
                    .iter()
                    .find(|f| f.path.as_deref() == Some(target))
                    .or_else(|| files.iter().find(|f| f.path.is_none()))
                    .or_else(|| files.first())
                    .ok_or_else(|| "generation returned no files".to_string())?;
                Ok(vec![Proposal {
                    path: target.to_string(),
                    content: (!chosen.delete).then(|| chosen.content.clone()),
                    rationale: rationale_or(&chosen.rationale, subtask),
                    from_template: false,
                }])
            }
            None => files
                .into_iter()
                .map(|f| {
                    let path = f
                        .path
                        .filter(|p| !p.trim().is_empty())
                        .ok_or_else(|| "generated file has no path".to_string())?;
                    Ok(Proposal {
                        path,
                        content: (!f.delete).then_some(f.content),
                        rationale: rationale_or(&f.rationale, subtask),
                        from_template: false,
                    })
                })
                .collect(),
        }
    }

    /// Fold a proposal into the output, reading the original through the
    /// tool layer the first time a path is touched.
    async fn merge(&self, output: &mut GenerationOutput, subtask_id: &str, proposal: Proposal) -> Result<()> {
        let path = self.tools.relative_path(&proposal.path)?;
        if path.is_empty() {
            return Err(Error::Validation("generated path names the repository root".into()));
        }

        if let Some(existing) = output.files.iter_mut().find(|f| f.path == path) {
            let content = proposal
                .content
                .ok_or_else(|| Error::Validation(format!("{} is deleted after being generated", path)))?;
            warn!(path = %path, subtask = subtask_id, "Path generated twice, keeping latest content");
            existing.set_content(content);
            existing.rationale = format!("{}; {}", existing.rationale, proposal.rationale);
            if !existing.subtask_ids.iter().any(|id| id == subtask_id) {
                existing.subtask_ids.push(subtask_id.to_string());
            }
            return Ok(());
        }

        let original = match self.tools.read_bytes(&path).await? {
            Some(bytes) => Some(
                String::from_utf8(bytes).map_err(|_| Error::Validation(format!("{} is not UTF-8 text", path)))?,
            ),
            None => None,
        };

        let mut file = match (proposal.content, original) {
            (None, None) => return Err(Error::Validation(format!("cannot delete missing file {}", path))),
            (None, Some(original)) => GeneratedFile::delete(&path, original, &proposal.rationale),
            (Some(content), original) => {
                if original.as_deref() == Some(content.as_str()) {
                    debug!(path = %path, "Generated content identical to original, skipping");
                    return Ok(());
                }
                GeneratedFile::new(&path, original, content, &proposal.rationale)
            }
        };
        file.subtask_ids.push(subtask_id.to_string());
        if proposal.from_template {
            output.reused_templates += 1;
        }
        output.files.push(file);
        Ok(())
    }
}

fn work_items<'a>(track: &[&'a Subtask]) -> Vec<WorkItem<'a>> {
    let mut items = Vec::new();
    for subtask in track.iter().copied().filter(|s| s.kind.produces_files()) {
        if subtask.files.is_empty() {
            items.push(WorkItem {
                order: items.len(),
                subtask,
                target: None,
            });
        } else {
            for target in &subtask.files {
                items.push(WorkItem {
                    order: items.len(),
                    subtask,
                    target: Some(target.as_str()),
                });
            }
        }
    }
    items
}

fn failure(subtask_id: &str, path: Option<String>, error: impl ToString) -> GenerationFailure {
    let error = error.to_string();
    warn!(subtask = subtask_id, path = ?path, error = %error, "File generation failed");
    GenerationFailure {
        subtask_id: subtask_id.to_string(),
        path,
        error,
    }
}

fn rationale_or(rationale: &str, subtask: &Subtask) -> String {
    if rationale.trim().is_empty() {
        subtask.description.clone()
    } else {
        rationale.trim().to_string()
    }
}

fn generation_prompt(
    prompt: &str,
    subtask: &Subtask,
    target: Option<&str>,
    existing: Option<&str>,
    ctx: &RepoContext,
    prior: &[GeneratedFile],
) -> String {
    let mut out = format!(
        "Overall request:\n{}\n\nSubtask {} ({}):\n{}\n",
        prompt.trim(),
        subtask.id,
        subtask.kind,
        subtask.description
    );
    match (target, existing) {
        (Some(path), Some(content)) => {
            out.push_str(&format!("\nModify {}. Current content:\n{}\n", path, content));
        }
        (Some(path), None) => out.push_str(&format!("\nCreate {}.\n", path)),
        (None, _) => out.push_str("\nChoose appropriate file paths relative to the repository root.\n"),
    }
    let relevant: Vec<&GeneratedFile> = prior
        .iter()
        .filter(|f| f.action() != FileAction::Delete)
        .filter(|f| f.subtask_ids.iter().any(|id| subtask.depends_on.contains(id)))
        .collect();
    if !relevant.is_empty() {
        out.push_str("\nFiles already generated by dependencies:\n");
        for f in relevant {
            out.push_str(&format!("\n--- {} ---\n{}\n", f.path, truncate_chars(f.content(), PRIOR_FILE_CHARS)));
        }
    }
    out.push('\n');
    out.push_str(&ctx.render());
    out
}
