//! Turns a change request into a planned subtask graph.

pub mod gates;
pub mod patterns;
pub mod plan;

use std::sync::Arc;

use tracing::{info, instrument};

use crate::ai::{schema, AiClient, Purpose};
use crate::config::PlannerConfig;
use crate::core::dag::SubtaskGraph;
use crate::core::plan::{Decomposition, ExecutionPlan, PatternMatch, QualityGateReport};
use crate::{Error, Result};

pub use patterns::{Pattern, PatternLibrary, PatternRegistry, PatternTemplate, SimilarityScorer, TokenDice};

const DECOMPOSE_SYSTEM: &str = "You plan code changes for a TypeScript/Node community platform. \
Break the request into an ordered list of small subtasks. Reply with JSON only: \
{\"subtasks\":[{\"id\":\"s1\",\"description\":\"...\",\"type\":\"code|test|doc|infra\",\
\"dependsOn\":[\"ids of EARLIER subtasks\"],\"estimatedMinutes\":30,\"files\":[\"relative/path.ts\"]}]}. \
Never put credentials in descriptions.";

pub struct TaskDecomposer {
    ai: AiClient,
    patterns: Arc<PatternRegistry>,
    config: PlannerConfig,
}

impl TaskDecomposer {
    pub fn new(ai: AiClient, patterns: Arc<PatternRegistry>, config: PlannerConfig) -> Self {
        Self { ai, patterns, config }
    }

    /// Ask the AI for subtasks, then derive tracks, gates and the plan.
    #[instrument(skip(self, prompt), fields(chars = prompt.len()))]
    pub async fn decompose_task(&self, prompt: &str) -> Result<Decomposition> {
        let library = self.patterns.get().await?;
        let patterns = library.match_prompt(prompt, self.config.pattern_threshold);

        let request = self.ai.request(
            Purpose::Decompose,
            DECOMPOSE_SYSTEM,
            decompose_prompt(prompt, &patterns, self.config.max_subtasks),
        );
        let response = self.ai.complete(&request).await?;
        let subtasks = schema::parse_subtasks(&response.text, self.config.max_subtasks)?;
        let graph = SubtaskGraph::from_subtasks(&subtasks).map_err(|e| Error::AiGeneration(e.to_string()))?;
        let tracks = plan::parallel_tracks(&graph);

        let mut decomposition = Decomposition {
            subtasks,
            tracks,
            patterns,
            quality_gates: QualityGateReport::default(),
            plan: ExecutionPlan::default(),
        };
        decomposition.quality_gates = self.validate_against_quality_gates(&decomposition);
        decomposition.plan = self.generate_execution_plan(&decomposition)?;

        info!(
            subtasks = decomposition.subtasks.len(),
            tracks = decomposition.tracks.len(),
            patterns = decomposition.patterns.len(),
            gate_score = decomposition.quality_gates.score,
            "Decomposed request"
        );
        Ok(decomposition)
    }

    pub fn validate_against_quality_gates(&self, decomposition: &Decomposition) -> QualityGateReport {
        gates::evaluate(&decomposition.subtasks)
    }

    pub fn generate_execution_plan(&self, decomposition: &Decomposition) -> Result<ExecutionPlan> {
        let graph = SubtaskGraph::from_subtasks(&decomposition.subtasks)?;
        plan::execution_plan(&graph, &decomposition.tracks)
    }
}

fn decompose_prompt(prompt: &str, patterns: &[PatternMatch], max_subtasks: usize) -> String {
    let mut out = format!("Request:\n{}\n\nUse at most {} subtasks.", prompt.trim(), max_subtasks);
    if !patterns.is_empty() {
        out.push_str("\n\nSimilar solved requests (hints only):");
        for p in patterns {
            out.push_str(&format!(
                "\n- {} (similarity {:.2}, saves ~{} min)",
                p.name, p.similarity, p.time_savings_minutes
            ));
        }
    }
    out
}
