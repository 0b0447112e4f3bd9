//! Structured logging for devpilot.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a task from completing
//! - WARN: Unexpected conditions that are recoverable (heal attempts, rollbacks)
//! - INFO: High-level lifecycle notifications (task transitions, server start)
//! - DEBUG: Detailed operation traces (tool calls, AI attempts)
//! - TRACE: Very detailed traces (raw completions, command output)
//!
//! Debug mode can be enabled with `--debug` flag or `DEVPILOT_DEBUG=1` env var.
//! `DEVPILOT_LOG` accepts a full `EnvFilter` directive and wins over both.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::Result;

pub const LOG_FILE: &str = "devpilot.log";
pub const FILTER_ENV: &str = "DEVPILOT_LOG";
pub const DEBUG_ENV: &str = "DEVPILOT_DEBUG";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging to `<dir>/devpilot.log`, optionally mirrored to stderr.
pub fn init(dir: &Path, debug: bool, console: bool) -> Result<()> {
    let debug_enabled = debug || env_debug();

    let filter = filter_for(std::env::var(FILTER_ENV).ok().as_deref(), debug_enabled);

    std::fs::create_dir_all(dir)?;
    // Truncate on startup
    std::fs::write(dir.join(LOG_FILE), "")?;
    let appender = tracing_appender::rolling::never(dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();
    Ok(())
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn filter_for(directive: Option<&str>, debug: bool) -> EnvFilter {
    let fallback = if debug { "devpilot=debug,info" } else { "info" };
    match directive.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => EnvFilter::try_new(d).unwrap_or_else(|_| EnvFilter::new(fallback)),
        None => EnvFilter::new(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults_to_info() {
        assert_eq!(filter_for(None, false).to_string(), "info");
    }

    #[test]
    fn test_filter_debug_mode() {
        assert!(filter_for(None, true).to_string().contains("devpilot=debug"));
    }

    #[test]
    fn test_filter_directive_wins() {
        assert_eq!(filter_for(Some("warn"), true).to_string(), "warn");
        assert_eq!(filter_for(Some("  "), false).to_string(), "info");
    }

    #[test]
    fn test_init_creates_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        init(dir.path(), false, false).unwrap();
        assert!(dir.path().join(LOG_FILE).exists());
    }
}
