//! Reusable solution patterns and how prompts are matched against them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;

use crate::core::plan::PatternMatch;
use crate::{Error, Result};

/// Scores how alike two pieces of text are, in 0.0..=1.0.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Dice coefficient over lowercase word sets, ignoring filler words.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenDice;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "to", "for", "of", "and", "or", "in", "on", "with", "that", "this", "is", "be",
    "please", "new", "our", "my",
];

pub fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

impl SimilarityScorer for TokenDice {
    fn score(&self, a: &str, b: &str) -> f64 {
        let a = tokens(a);
        let b = tokens(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(&b).count();
        (2 * shared) as f64 / (a.len() + b.len()) as f64
    }
}

/// File content a pattern can produce without an AI call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternTemplate {
    /// Default target path when the subtask names none.
    pub path: String,
    /// `{{description}}` and `{{name}}` are substituted on adaptation.
    pub content: String,
}

impl PatternTemplate {
    pub fn adapt(&self, name: &str, description: &str) -> String {
        self.content
            .replace("{{name}}", name)
            .replace("{{description}}", description)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub name: String,
    /// Phrases describing requests this pattern solved.
    pub examples: Vec<String>,
    pub time_savings_minutes: u32,
    #[serde(default)]
    pub template: Option<PatternTemplate>,
}

pub struct PatternLibrary {
    patterns: Vec<Pattern>,
    scorer: Arc<dyn SimilarityScorer>,
}

impl PatternLibrary {
    pub fn new(patterns: Vec<Pattern>, scorer: Arc<dyn SimilarityScorer>) -> Self {
        Self { patterns, scorer }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_patterns(), Arc::new(TokenDice))
    }

    /// Load patterns from a JSON array file, scored with [`TokenDice`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let patterns: Vec<Pattern> = serde_json::from_str(&content)?;
        if patterns.iter().any(|p| p.examples.is_empty()) {
            return Err(Error::Validation(format!(
                "pattern library {} has a pattern without examples",
                path.display()
            )));
        }
        Ok(Self::new(patterns, Arc::new(TokenDice)))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    fn similarity(&self, pattern: &Pattern, text: &str) -> f64 {
        pattern
            .examples
            .iter()
            .map(|e| self.scorer.score(text, e))
            .fold(0.0, f64::max)
    }

    /// Patterns scoring at or above `threshold`, best first.
    pub fn match_prompt(&self, text: &str, threshold: f64) -> Vec<PatternMatch> {
        let mut matches: Vec<PatternMatch> = self
            .patterns
            .iter()
            .filter_map(|p| {
                let similarity = self.similarity(p, text);
                (similarity >= threshold).then(|| PatternMatch {
                    name: p.name.clone(),
                    similarity: (similarity * 1000.0).round() / 1000.0,
                    time_savings_minutes: p.time_savings_minutes,
                    has_template: p.template.is_some(),
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.name.cmp(&b.name)));
        matches
    }

    /// The best-scoring pattern with a template, if it reaches `threshold`.
    pub fn best_template(&self, text: &str, threshold: f64) -> Option<(&Pattern, &PatternTemplate, f64)> {
        self.patterns
            .iter()
            .filter_map(|p| p.template.as_ref().map(|t| (p, t, self.similarity(p, text))))
            .filter(|(_, _, s)| *s >= threshold)
            .max_by(|a, b| a.2.total_cmp(&b.2))
    }
}

impl std::fmt::Debug for PatternLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternLibrary")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

/// Loads the pattern library once, on first use.
#[derive(Debug, Default)]
pub struct PatternRegistry {
    source: Option<PathBuf>,
    library: OnceCell<Arc<PatternLibrary>>,
}

impl PatternRegistry {
    pub fn new(source: Option<PathBuf>) -> Self {
        Self {
            source,
            library: OnceCell::new(),
        }
    }

    /// A registry that is ready immediately with `library`.
    pub fn preloaded(library: PatternLibrary) -> Self {
        Self {
            source: None,
            library: OnceCell::new_with(Some(Arc::new(library))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.library.initialized()
    }

    pub async fn get(&self) -> Result<Arc<PatternLibrary>> {
        let library = self
            .library
            .get_or_try_init(|| async {
                let library = match &self.source {
                    Some(path) => {
                        let path = path.clone();
                        crate::util::blocking(move || PatternLibrary::from_file(&path)).await?
                    }
                    None => PatternLibrary::builtin(),
                };
                info!(patterns = library.len(), "Pattern library loaded");
                Ok::<_, Error>(Arc::new(library))
            })
            .await?;
        Ok(library.clone())
    }
}

const HEALTH_TEMPLATE: &str = r#"import { Router, type Request, type Response } from "express";

// {{description}}
export const healthRouter = Router();

healthRouter.get("/api/health", (_req: Request, res: Response) => {
  res.status(200).json({
    status: "ok",
    uptime: process.uptime(),
    timestamp: new Date().toISOString(),
  });
});
"#;

fn builtin_patterns() -> Vec<Pattern> {
    let pattern = |name: &str, examples: &[&str], minutes: u32, template: Option<PatternTemplate>| Pattern {
        name: name.to_string(),
        examples: examples.iter().map(|e| e.to_string()).collect(),
        time_savings_minutes: minutes,
        template,
    };
    vec![
        pattern(
            "health-check-endpoint",
            &[
                "add health check endpoint",
                "create health check route",
                "health endpoint status uptime",
            ],
            25,
            Some(PatternTemplate {
                path: "server/routes/health.ts".to_string(),
                content: HEALTH_TEMPLATE.to_string(),
            }),
        ),
        pattern(
            "crud-endpoint",
            &["add crud endpoints for resource", "create rest api routes list create update delete"],
            60,
            None,
        ),
        pattern(
            "database-migration",
            &["add database table migration", "add column to table schema migration"],
            40,
            None,
        ),
        pattern(
            "auth-middleware",
            &["add authentication middleware", "protect routes require logged in user"],
            45,
            None,
        ),
        pattern(
            "pagination",
            &["add pagination to list endpoint", "paginate feed results cursor"],
            30,
            None,
        ),
        pattern(
            "unit-test-suite",
            &["add unit tests", "write tests for module"],
            20,
            None,
        ),
    ]
}
