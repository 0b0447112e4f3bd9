//! Bounded self-healing loop.
//!
//! Each failed validation either schedules another heal attempt or, once the
//! ceiling is reached, escalates to a human. Patches are applied to the
//! in-memory generated files only.

use tracing::warn;

use crate::ai::schema::FilePatch;
use crate::core::files::{FileAction, GeneratedFile, Severity, ValidationReport};
use crate::util::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealState {
    /// Waiting for the first validation result.
    Validating,
    /// A heal attempt is due; `attempt` is 1-based.
    Healing { attempt: u32 },
    Passed,
    /// Ceiling reached with validation still failing.
    Escalated,
}

#[derive(Debug, Clone)]
pub struct HealLoop {
    state: HealState,
    attempts: u32,
    max_attempts: u32,
}

impl HealLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: HealState::Validating,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, HealState::Passed | HealState::Escalated)
    }

    /// Advance on a validation outcome.
    pub fn record(&mut self, safe: bool) -> HealState {
        if self.is_finished() {
            return self.state;
        }
        self.state = if safe {
            HealState::Passed
        } else if self.attempts < self.max_attempts {
            self.attempts += 1;
            HealState::Healing { attempt: self.attempts }
        } else {
            HealState::Escalated
        };
        self.state
    }
}

/// Characters of each file shown to the healer.
const HEAL_FILE_CHARS: usize = 12_000;

pub const HEAL_SYSTEM: &str = "You fix generated code so it passes static checks and tests. \
Reply with JSON only: {\"patches\":[{\"path\":\"relative/path.ts\",\"content\":\"full corrected file\"}]}. \
Only patch files listed in the request.";

pub fn heal_prompt(request: &str, files: &[GeneratedFile], report: &ValidationReport) -> String {
    let mut out = format!("Original request:\n{}\n\nProblems:\n", request.trim());
    for diag in &report.files {
        for m in &diag.messages {
            let level = match m.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            match m.line {
                Some(line) => out.push_str(&format!("- {}:{} [{}] {}\n", diag.path, line, level, m.message)),
                None => out.push_str(&format!("- {} [{}] {}\n", diag.path, level, m.message)),
            }
        }
    }
    if !report.tests.success {
        out.push_str(&format!(
            "- tests: {} passed, {} failed\n{}\n",
            report.tests.passed, report.tests.failed, report.tests.output_tail
        ));
    }
    out.push_str("\nFiles:\n");
    for f in files.iter().filter(|f| f.action() != FileAction::Delete) {
        out.push_str(&format!("\n--- {} ---\n{}\n", f.path, truncate_chars(f.content(), HEAL_FILE_CHARS)));
    }
    out
}

/// Apply patches to matching files. Returns how many were applied.
pub fn apply_patches(files: &mut [GeneratedFile], patches: Vec<FilePatch>) -> usize {
    let mut applied = 0;
    for patch in patches {
        let path = patch.path.trim().trim_start_matches("./");
        match files.iter_mut().find(|f| f.path == path) {
            Some(file) if file.content() != patch.content => {
                file.set_content(patch.content);
                applied += 1;
            }
            Some(_) => {}
            None => warn!(path, "Heal patch names a file outside the change set, ignoring"),
        }
    }
    applied
}
