//! Parallel tracks and execution plans derived from the subtask graph.

use crate::core::dag::SubtaskGraph;
use crate::core::plan::{Checkpoint, ExecutionPlan, ParallelTrack, Phase};
use crate::Result;

/// One track per topological level.
pub fn parallel_tracks(graph: &SubtaskGraph) -> Vec<ParallelTrack> {
    graph
        .levels()
        .into_iter()
        .enumerate()
        .map(|(index, ids)| {
            let duration_minutes = ids
                .iter()
                .filter_map(|id| graph.get(id))
                .map(|s| s.estimated_minutes)
                .max()
                .unwrap_or(0);
            ParallelTrack {
                index,
                subtask_ids: ids,
                duration_minutes,
            }
        })
        .collect()
}

/// Phases follow tracks; each ends with a checkpoint. The parallelization
/// factor is total effort over critical-path effort, so a linear chain is 1.0.
pub fn execution_plan(graph: &SubtaskGraph, tracks: &[ParallelTrack]) -> Result<ExecutionPlan> {
    let (critical_path, critical_path_minutes) = graph.critical_path()?;
    let total_minutes = graph.total_minutes();
    let last = tracks.len().saturating_sub(1);

    let phases = tracks
        .iter()
        .map(|track| {
            let description = if track.index == last {
                "Validate the complete change set before approval".to_string()
            } else {
                format!(
                    "Validate {} before starting phase {}",
                    track.subtask_ids.join(", "),
                    track.index + 2
                )
            };
            Phase {
                index: track.index,
                subtask_ids: track.subtask_ids.clone(),
                duration_minutes: track.duration_minutes,
                checkpoint: Checkpoint {
                    after_phase: track.index,
                    subtask_ids: track.subtask_ids.clone(),
                    description,
                },
            }
        })
        .collect();

    let parallelization_factor = if critical_path_minutes == 0 {
        1.0
    } else {
        total_minutes as f64 / critical_path_minutes as f64
    };

    Ok(ExecutionPlan {
        phases,
        critical_path,
        critical_path_minutes,
        total_minutes,
        parallelization_factor,
    })
}
