//! Validation of generated changes before they reach the working tree.
//!
//! Diagnostics run on the in-memory files (built-in checks) and on staged
//! copies under `.devpilot/staging/` (configured linters). The test suite
//! runs in a staged copy of the whole tree with the generated files laid
//! over it. A failing report enters the bounded heal loop; whatever remains
//! unsafe after the ceiling is escalated. Snapshots and rollback live here
//! too, since they share the tool layer and state directory.

pub mod diagnostics;
pub mod heal;
pub mod snapshot;
pub mod suite;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::ai::{schema, AiClient, Purpose};
use crate::config::ValidatorConfig;
use crate::core::files::{Diagnostic, FileAction, FileDiagnostics, GeneratedFile, TestReport, ValidationReport};
use crate::core::task::TaskId;
use crate::tools::{Overlay, ToolExecutor, STAGING_DIR};
use crate::{Error, Result};

pub use heal::{HealLoop, HealState};
pub use snapshot::{RollbackReport, Snapshot, SnapshotStore};

pub struct Validator {
    tools: Arc<ToolExecutor>,
    ai: AiClient,
    config: ValidatorConfig,
    snapshots: SnapshotStore,
}

impl Validator {
    pub fn new(tools: Arc<ToolExecutor>, ai: AiClient, config: ValidatorConfig, state_dir: &Path) -> Self {
        Self {
            tools,
            ai,
            config,
            snapshots: SnapshotStore::new(state_dir),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Structural checks for every written file, plus the configured linter
    /// for its language. Deleted files are not checked.
    pub async fn check_diagnostics(&self, files: &[GeneratedFile]) -> Result<Vec<FileDiagnostics>> {
        let mut out = Vec::with_capacity(files.len());
        for file in files.iter().filter(|f| f.action() != FileAction::Delete) {
            let mut diags = FileDiagnostics::new(&file.path);
            for d in diagnostics::structural(&file.language, file.content()) {
                diags.push(d);
            }
            if let Some(command) = self.config.lint_commands.get(&file.language) {
                for d in self.lint(command, file).await? {
                    diags.push(d);
                }
            }
            debug!(path = %file.path, errors = diags.errors, warnings = diags.warnings, "Diagnostics");
            out.push(diags);
        }
        Ok(out)
    }

    async fn lint(&self, template: &str, file: &GeneratedFile) -> Result<Vec<Diagnostic>> {
        let staged = format!("{}/{}/{}", STAGING_DIR, Uuid::new_v4(), file.path);
        self.tools.write_file(&staged, file.content()).await?;

        let command = template.replace("{file}", &shell_quote(&staged));
        let tool = template.split_whitespace().next().unwrap_or("lint").to_string();
        let result = match self.tools.execute_command(&command, None).await {
            Ok(output) => Ok(diagnostics::classify_lint_output(&tool, output.exit_code, &output.combined())),
            Err(Error::Timeout(limit)) => Ok(vec![diagnostics::timed_out(&tool, limit)]),
            Err(e) => Err(e),
        };

        // Staging is scratch space; a failed cleanup must not hide the lint result.
        if let Err(e) = self.tools.delete_file(&staged).await {
            warn!(path = %staged, error = %e, "Failed to remove staged file");
        } else if let Err(e) = snapshot::remove_empty_parents(&self.tools, &staged).await {
            warn!(path = %staged, error = %e, "Failed to remove staging directory");
        }
        result
    }

    /// Run the test suite against the working tree as it is.
    pub async fn run_tests(&self) -> Result<TestReport> {
        suite::run_tests(&self.tools, self.config.test_command.as_deref(), "", self.test_timeout()).await
    }

    /// Run the test suite against a staged copy of the tree with `files`
    /// applied. The working tree is not modified.
    pub async fn run_tests_against(&self, files: &[GeneratedFile]) -> Result<TestReport> {
        let command = self.config.test_command.as_deref();
        if command.map(str::trim).filter(|c| !c.is_empty()).is_none() {
            return suite::run_tests(&self.tools, None, "", self.test_timeout()).await;
        }

        let stage = format!("{}/{}", STAGING_DIR, Uuid::new_v4());
        let overlay: Overlay = files
            .iter()
            .map(|f| match f.action() {
                FileAction::Delete => (f.path.clone(), None),
                _ => (f.path.clone(), Some(f.content().to_string())),
            })
            .collect();

        let result = match self.tools.stage_tree(&stage, &overlay).await {
            Ok(summary) => {
                debug!(stage = %stage, copied = summary.copied, linked = summary.linked, "Staged tree for tests");
                suite::run_tests(&self.tools, command, &stage, self.test_timeout()).await
            }
            Err(e) => Err(e),
        };

        // A stale stage only costs disk space; the test result stands.
        if let Err(e) = self.tools.discard_stage(&stage).await {
            warn!(stage = %stage, error = %e, "Failed to remove staged tree");
        } else if let Err(e) = snapshot::remove_empty_parents(&self.tools, &stage).await {
            warn!(stage = %stage, error = %e, "Failed to remove staging directory");
        }
        result
    }

    fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.config.test_timeout_secs)
    }

    /// Combine diagnostics and test results into a report with its safety flag.
    pub fn report(&self, files: Vec<FileDiagnostics>, tests: TestReport, heal_attempts: u32) -> ValidationReport {
        let total_errors: usize = files.iter().map(|f| f.errors).sum();
        let total_warnings: usize = files.iter().map(|f| f.warnings).sum();

        let mut warnings = Vec::new();
        if tests.skipped {
            warnings.push("no test command configured, tests were skipped".to_string());
        }
        if total_warnings > self.config.max_warnings {
            warnings.push(format!(
                "{} warnings exceed the limit of {}",
                total_warnings, self.config.max_warnings
            ));
        }
        let safe = total_errors <= self.config.max_errors
            && total_warnings <= self.config.max_warnings
            && tests.success;

        ValidationReport {
            files,
            tests,
            total_errors,
            total_warnings,
            safe,
            warnings,
            heal_attempts,
        }
    }

    /// One validation pass without healing.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn validate(&self, files: &[GeneratedFile]) -> Result<ValidationReport> {
        let diagnostics = self.check_diagnostics(files).await?;
        let tests = self.run_tests_against(files).await?;
        let report = self.report(diagnostics, tests, 0);
        info!(
            safe = report.safe,
            errors = report.total_errors,
            warnings = report.total_warnings,
            "Validation finished"
        );
        Ok(report)
    }

    /// Validate, then ask the AI to patch the in-memory files until the
    /// report is safe or the attempt ceiling is reached. The returned report
    /// describes the final state; callers check `safe` and use
    /// [`Validator::escalation_error`] when it is false.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn validate_and_heal(
        &self,
        request: &str,
        files: &mut [GeneratedFile],
        cancel: &CancellationToken,
    ) -> Result<ValidationReport> {
        let mut heal = HealLoop::new(self.config.max_heal_attempts);

        loop {
            let diagnostics = self.check_diagnostics(files).await?;
            let tests = self.run_tests_against(files).await?;
            let report = self.report(diagnostics, tests, heal.attempts());
            let state = heal.record(report.safe);

            match state {
                HealState::Passed => {
                    info!(attempts = heal.attempts(), "Validation passed");
                    return Ok(report);
                }
                HealState::Escalated => {
                    warn!(
                        attempts = heal.attempts(),
                        errors = report.total_errors,
                        warnings = report.total_warnings,
                        tests_passed = report.tests.success,
                        "Validation escalated for human review"
                    );
                    return Ok(report);
                }
                HealState::Healing { attempt } => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    info!(
                        attempt,
                        errors = report.total_errors,
                        tests_failed = !report.tests.success,
                        "Healing generated files"
                    );
                    let prompt = heal::heal_prompt(request, files, &report);
                    let completion = self.ai.request(Purpose::Heal, heal::HEAL_SYSTEM, prompt);
                    let response = tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        r = self.ai.complete(&completion) => r,
                    };
                    match response.and_then(|r| schema::parse_heal(&r.text)) {
                        Ok(patches) => {
                            let applied = heal::apply_patches(files, patches);
                            debug!(attempt, applied, "Heal patches applied");
                        }
                        Err(e) => warn!(attempt, error = %e, "Heal attempt produced no usable patch"),
                    }
                }
                HealState::Validating => {}
            }
        }
    }

    /// Error a task fails with when its report stays unsafe.
    pub fn escalation_error(&self, report: &ValidationReport) -> Error {
        if report.total_errors > self.config.max_errors || report.total_warnings > self.config.max_warnings {
            Error::StaticAnalysis(format!(
                "{} errors and {} warnings remain after {} heal attempts",
                report.total_errors, report.total_warnings, report.heal_attempts
            ))
        } else {
            Error::TestFailure(format!(
                "{} failed, {} passed ({})",
                report.tests.failed,
                report.tests.passed,
                report.tests.command.as_deref().unwrap_or("no command")
            ))
        }
    }

    /// Capture the current bytes of `paths` and HEAD before mutation.
    pub async fn snapshot(&self, task_id: Option<TaskId>, paths: &[String]) -> Result<Snapshot> {
        self.snapshots.capture(&self.tools, task_id, paths).await
    }

    pub async fn rollback(&self, snapshot_id: &str) -> Result<RollbackReport> {
        self.snapshots.restore(&self.tools, snapshot_id).await
    }
}

/// Single-quote `s` for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
