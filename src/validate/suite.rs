//! Test command execution and result parsing.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{info, warn};

use crate::core::files::TestReport;
use crate::tools::ToolExecutor;
use crate::{Error, Result};

/// Characters of output kept on the report.
const OUTPUT_TAIL_CHARS: usize = 2_000;

/// Run `command` in `dir` (root-relative, empty for the project root). A
/// failing or timed-out suite is reported, not returned as an error.
pub async fn run_tests(tools: &ToolExecutor, command: Option<&str>, dir: &str, timeout: Duration) -> Result<TestReport> {
    let Some(command) = command.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(TestReport {
            success: true,
            skipped: true,
            ..Default::default()
        });
    };

    let started = Instant::now();
    let (exit_code, output) = match tools.execute_command_in(command, dir, Some(timeout)).await {
        Ok(out) => (out.exit_code, out.combined()),
        Err(Error::Timeout(limit)) => (None, format!("test command timed out after {:?}", limit)),
        Err(e) => return Err(e),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let (passed, failed) = parse_counts(&output);
    let success = exit_code == Some(0) && failed == 0;
    if success {
        info!(command, passed, duration_ms, "Tests passed");
    } else {
        warn!(command, passed, failed, ?exit_code, "Tests failed");
    }

    Ok(TestReport {
        command: Some(command.to_string()),
        passed,
        failed,
        duration_ms,
        success,
        skipped: false,
        output_tail: tail(&output, OUTPUT_TAIL_CHARS),
    })
}

fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max)).collect()
}

fn count_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s+(passed|passing|failed|failing)").ok())
        .as_ref()
}

fn counts_in(line: &str) -> (usize, usize) {
    let Some(re) = count_regex() else {
        return (0, 0);
    };
    let mut passed = 0;
    let mut failed = 0;
    for cap in re.captures_iter(line) {
        let n: usize = cap[1].parse().unwrap_or(0);
        match cap[2].to_ascii_lowercase().as_str() {
            "passed" | "passing" => passed += n,
            _ => failed += n,
        }
    }
    (passed, failed)
}

/// Pass/fail counts from Jest, Vitest, cargo, pytest or Mocha output.
pub fn parse_counts(output: &str) -> (usize, usize) {
    // Jest / Vitest print a "Tests:" summary beside "Test Suites:".
    if let Some(line) = output
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with("Tests:") || l.trim_start().starts_with("Tests "))
    {
        return counts_in(line);
    }

    // cargo prints one "test result:" line per test binary.
    let cargo: Vec<&str> = output.lines().filter(|l| l.contains("test result:")).collect();
    if !cargo.is_empty() {
        return cargo.iter().fold((0, 0), |(p, f), l| {
            let (lp, lf) = counts_in(l);
            (p + lp, f + lf)
        });
    }

    // pytest and Mocha end with their summary; sum the summary lines.
    output
        .lines()
        .rev()
        .filter(|l| counts_in(l) != (0, 0))
        .take(2)
        .fold((0, 0), |(p, f), l| {
            let (lp, lf) = counts_in(l);
            (p + lp, f + lf)
        })
}
