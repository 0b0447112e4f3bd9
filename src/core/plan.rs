//! Planning data model: subtasks, tracks, gates and execution plans.

use serde::{Deserialize, Serialize};

/// Kind of work a subtask represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskType {
    Code,
    Test,
    Doc,
    Infra,
}

impl SubtaskType {
    /// Whether this kind of subtask yields source files.
    pub fn produces_files(self) -> bool {
        matches!(self, SubtaskType::Code | SubtaskType::Test)
    }
}

impl std::fmt::Display for SubtaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskType::Code => write!(f, "code"),
            SubtaskType::Test => write!(f, "test"),
            SubtaskType::Doc => write!(f, "doc"),
            SubtaskType::Infra => write!(f, "infra"),
        }
    }
}

/// An atomic unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: SubtaskType,
    /// Ids of earlier subtasks that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub estimated_minutes: u32,
    /// Files the subtask expects to create or modify, relative to the root.
    #[serde(default)]
    pub files: Vec<String>,
}

/// Subtasks whose dependencies are all satisfied by earlier tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelTrack {
    pub index: usize,
    pub subtask_ids: Vec<String>,
    /// Duration of the longest subtask in the track.
    pub duration_minutes: u32,
}

/// A prior solved request that resembles the current prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternMatch {
    pub name: String,
    pub similarity: f64,
    pub time_savings_minutes: u32,
    pub has_template: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSeverity {
    /// Failing stops the task before generation.
    Blocker,
    /// Failing is reported but does not stop progression.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCheck {
    pub name: String,
    pub weight: u32,
    pub severity: GateSeverity,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateReport {
    /// Weighted pass percentage in 0..=100.
    pub score: f64,
    pub checks: Vec<GateCheck>,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
}

impl QualityGateReport {
    pub fn passed(&self) -> bool {
        self.blockers.is_empty()
    }
}

/// Validation point emitted at the end of each phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub after_phase: usize,
    pub subtask_ids: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub index: usize,
    pub subtask_ids: Vec<String>,
    pub duration_minutes: u32,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub phases: Vec<Phase>,
    pub critical_path: Vec<String>,
    pub critical_path_minutes: u32,
    pub total_minutes: u32,
    /// Sum of all durations over the critical-path duration.
    pub parallelization_factor: f64,
}

/// Everything the decomposer produced for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decomposition {
    pub subtasks: Vec<Subtask>,
    pub tracks: Vec<ParallelTrack>,
    pub patterns: Vec<PatternMatch>,
    pub quality_gates: QualityGateReport,
    pub plan: ExecutionPlan,
}

impl Decomposition {
    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    /// Subtasks of each track, in track order.
    pub fn tracks_of_subtasks(&self) -> Vec<Vec<&Subtask>> {
        self.tracks
            .iter()
            .map(|track| {
                track
                    .subtask_ids
                    .iter()
                    .filter_map(|id| self.subtask(id))
                    .collect()
            })
            .collect()
    }
}
