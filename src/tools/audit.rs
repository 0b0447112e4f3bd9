//! Append-only audit trail of tool calls.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// In-memory entries kept; older ones survive only in the file.
pub const MAX_IN_MEMORY: usize = 10_000;

/// How much damage an operation kind can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Read,
    Write,
    Shell,
    Database,
    Vcs,
    Secret,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub risk: RiskClass,
    pub details: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    file: Option<PathBuf>,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            file: None,
        }
    }

    /// Also append each entry as a JSON line to `file`.
    pub fn with_file(file: PathBuf) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            file: Some(file),
        }
    }

    pub fn record(&self, entry: AuditLogEntry) {
        if let Some(path) = &self.file {
            if let Err(e) = append_line(path, &entry) {
                warn!(path = %path.display(), error = %e, "Failed to append audit entry");
            }
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_IN_MEMORY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<AuditLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.back().cloned()
    }

    pub fn failures(&self) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|e| !e.success).cloned().collect()
    }
}

fn append_line(path: &PathBuf, entry: &AuditLogEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(op: &str, success: bool) -> AuditLogEntry {
        AuditLogEntry {
            timestamp: Utc::now(),
            operation: op.to_string(),
            risk: RiskClass::Read,
            details: "path=src/a.ts".to_string(),
            success,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_record_and_failures() {
        let log = AuditLog::in_memory();
        assert!(log.is_empty());
        log.record(entry("read_file", true));
        log.record(entry("write_file", false));
        assert_eq!(log.len(), 2);
        assert_eq!(log.failures().len(), 1);
        assert_eq!(log.last().unwrap().operation, "write_file");
    }

    #[test]
    fn test_file_sink_appends_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/audit.log");
        let log = AuditLog::with_file(path.clone());
        log.record(entry("read_file", true));
        log.record(entry("query_database", false));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditLogEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.operation, "query_database");
        assert!(!parsed.success);
    }

    #[test]
    fn test_in_memory_cap() {
        let log = AuditLog::in_memory();
        for _ in 0..(MAX_IN_MEMORY + 5) {
            log.record(entry("list_files", true));
        }
        assert_eq!(log.len(), MAX_IN_MEMORY);
    }
}
