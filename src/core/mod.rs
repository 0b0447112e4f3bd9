//! Core domain models for the coding agent.
//!
//! This module contains the data structures shared by every stage:
//! the task record and its state machine, the subtask graph, plans,
//! generated files and validation reports.

pub mod dag;
pub mod diff;
pub mod files;
pub mod plan;
pub mod task;

pub use dag::SubtaskGraph;
pub use diff::FileDiff;
pub use files::{
    Diagnostic, FileAction, FileDiagnostics, GeneratedFile, GenerationFailure, ImportRef,
    Severity, TestReport, ValidationReport,
};
pub use plan::{
    Checkpoint, Decomposition, ExecutionPlan, GateCheck, GateSeverity, ParallelTrack,
    PatternMatch, Phase, QualityGateReport, Subtask, SubtaskType,
};
pub use task::{StatusHistoryEntry, Task, TaskId, TaskStatus};
