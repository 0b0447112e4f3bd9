//! Weighted quality gates applied to a decomposition before generation.

use std::collections::BTreeSet;

use crate::ai::schema::{MAX_ESTIMATE_MINUTES, MIN_ESTIMATE_MINUTES};
use crate::core::dag::SubtaskGraph;
use crate::core::plan::{GateCheck, GateSeverity, QualityGateReport, Subtask, SubtaskType};
use crate::util::find_secret;

/// Scope beyond which a request should be split.
pub const MAX_SCOPED_SUBTASKS: usize = 15;
pub const MAX_SCOPED_FILES: usize = 20;
/// Total planned effort beyond which estimates look unreliable.
pub const MAX_TOTAL_MINUTES: u32 = 40 * 60;

struct Gate {
    name: &'static str,
    weight: u32,
    severity: GateSeverity,
    check: fn(&[Subtask]) -> Result<String, String>,
}

const GATES: &[Gate] = &[
    Gate {
        name: "has_code_subtask",
        weight: 25,
        severity: GateSeverity::Blocker,
        check: has_code_subtask,
    },
    Gate {
        name: "acyclic_dependencies",
        weight: 25,
        severity: GateSeverity::Blocker,
        check: acyclic_dependencies,
    },
    Gate {
        name: "no_hardcoded_secrets",
        weight: 20,
        severity: GateSeverity::Blocker,
        check: no_hardcoded_secrets,
    },
    Gate {
        name: "includes_tests",
        weight: 10,
        severity: GateSeverity::Warning,
        check: includes_tests,
    },
    Gate {
        name: "estimates_reasonable",
        weight: 10,
        severity: GateSeverity::Warning,
        check: estimates_reasonable,
    },
    Gate {
        name: "bounded_scope",
        weight: 10,
        severity: GateSeverity::Warning,
        check: bounded_scope,
    },
];

/// Run every gate. The score is the weighted share of passing checks.
pub fn evaluate(subtasks: &[Subtask]) -> QualityGateReport {
    let mut report = QualityGateReport::default();
    let mut earned = 0u32;
    let mut possible = 0u32;

    for gate in GATES {
        let outcome = (gate.check)(subtasks);
        let passed = outcome.is_ok();
        let message = match outcome {
            Ok(m) | Err(m) => m,
        };
        possible += gate.weight;
        if passed {
            earned += gate.weight;
        } else {
            let line = format!("{}: {}", gate.name, message);
            match gate.severity {
                GateSeverity::Blocker => report.blockers.push(line),
                GateSeverity::Warning => report.warnings.push(line),
            }
        }
        report.checks.push(GateCheck {
            name: gate.name.to_string(),
            weight: gate.weight,
            severity: gate.severity,
            passed,
            message,
        });
    }

    report.score = if possible == 0 {
        0.0
    } else {
        (earned as f64 * 1000.0 / possible as f64).round() / 10.0
    };
    report
}

fn has_code_subtask(subtasks: &[Subtask]) -> Result<String, String> {
    let count = subtasks.iter().filter(|s| s.kind == SubtaskType::Code).count();
    if count > 0 {
        Ok(format!("{} code subtask(s)", count))
    } else {
        Err("no code subtask; nothing would be generated".into())
    }
}

fn acyclic_dependencies(subtasks: &[Subtask]) -> Result<String, String> {
    let graph = SubtaskGraph::from_subtasks(subtasks).map_err(|e| e.to_string())?;
    if graph.is_acyclic() {
        Ok(format!("{} dependency edge(s), no cycles", graph.dependency_count()))
    } else {
        Err("dependency cycle detected".into())
    }
}

fn no_hardcoded_secrets(subtasks: &[Subtask]) -> Result<String, String> {
    for s in subtasks {
        if let Some(kind) = find_secret(&s.description) {
            return Err(format!("subtask {} embeds a {}", s.id, kind));
        }
    }
    Ok("no credentials in plan".into())
}

fn includes_tests(subtasks: &[Subtask]) -> Result<String, String> {
    if subtasks.iter().any(|s| s.kind == SubtaskType::Test) {
        Ok("test coverage planned".into())
    } else {
        Err("no test subtask planned".into())
    }
}

fn estimates_reasonable(subtasks: &[Subtask]) -> Result<String, String> {
    let range = MIN_ESTIMATE_MINUTES..=MAX_ESTIMATE_MINUTES;
    if let Some(s) = subtasks.iter().find(|s| !range.contains(&s.estimated_minutes)) {
        return Err(format!("subtask {} estimate {} min is out of range", s.id, s.estimated_minutes));
    }
    let total: u32 = subtasks.iter().map(|s| s.estimated_minutes).sum();
    if total > MAX_TOTAL_MINUTES {
        return Err(format!("total estimate {} min exceeds {} min", total, MAX_TOTAL_MINUTES));
    }
    Ok(format!("{} min total", total))
}

fn bounded_scope(subtasks: &[Subtask]) -> Result<String, String> {
    let files: BTreeSet<&str> = subtasks
        .iter()
        .flat_map(|s| s.files.iter().map(String::as_str))
        .collect();
    if subtasks.len() > MAX_SCOPED_SUBTASKS {
        Err(format!("{} subtasks exceeds {}", subtasks.len(), MAX_SCOPED_SUBTASKS))
    } else if files.len() > MAX_SCOPED_FILES {
        Err(format!("{} target files exceeds {}", files.len(), MAX_SCOPED_FILES))
    } else {
        Ok(format!("{} subtask(s), {} file(s)", subtasks.len(), files.len()))
    }
}
