//! Shell command screening and bounded execution.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Targets whose recursive deletion is never allowed.
const PROTECTED_TARGETS: &[&str] = &[
    "/", "/*", "~", "~/", "~/*", "$HOME", "${HOME}", "$HOME/", "${HOME}/", "/.", "/..",
];

/// Commands that switch to another user.
const ESCALATION_COMMANDS: &[&str] = &["sudo", "su", "doas", "pkexec", "runuser"];

fn blocked_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"--no-preserve-root", "recursive root deletion"),
            (r"\bdd\b[^;&|]*\bof=/dev/", "raw disk write"),
            (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem format"),
            (r"\b(wipefs|shred)\b[^;&|]*/dev/", "raw disk write"),
            (r">\s*/dev/(sd|hd|nvme|xvd|vd|mmcblk|disk)", "raw disk write"),
            (r"\bchmod\b[^;&|]*([ugoa]*\+[rwx]*s|\b[2-7][0-7]{3}\b)", "setuid/setgid permission escalation"),
            (r"\bchmod\s+-R\s+[0-7]*7[0-7]*\s+/(\s|$)", "permission escalation on root"),
            (r"\bchown\s+-R\b[^;&|]*\s/(\s|$)", "ownership change on root"),
            (r"\(\)\s*\{[^}]*\|[^}]*&\s*\}\s*;", "fork bomb"),
        ]
        .into_iter()
        .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, reason)))
        .collect()
    })
}

/// Reject destructive commands before anything is spawned.
pub fn screen_command(command: &str) -> Result<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("empty command".into()));
    }
    for (re, reason) in blocked_patterns() {
        if re.is_match(trimmed) {
            return Err(Error::blocked("execute_command", *reason));
        }
    }
    for segment in split_segments(trimmed) {
        let tokens: Vec<&str> = segment.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            continue;
        };
        let program = basename(first);
        if ESCALATION_COMMANDS.contains(&program) {
            return Err(Error::blocked(
                "execute_command",
                format!("privilege escalation via {}", program),
            ));
        }
        if program == "rm" && is_recursive_root_delete(&tokens[1..]) {
            return Err(Error::blocked("execute_command", "recursive root deletion"));
        }
    }
    Ok(())
}

fn split_segments(command: &str) -> Vec<&str> {
    command
        .split(|c| c == ';' || c == '&' || c == '|' || c == '\n' || c == '(' || c == ')' || c == '`')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

fn is_recursive_root_delete(args: &[&str]) -> bool {
    let recursive = args.iter().any(|a| {
        *a == "--recursive"
            || (a.starts_with('-') && !a.starts_with("--") && a.contains(['r', 'R']))
    });
    let protected = args.iter().any(|a| {
        let unquoted = a.trim_matches(|c| c == '"' || c == '\'');
        PROTECTED_TARGETS.contains(&unquoted)
    });
    recursive && protected
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Some output beyond the buffer cap was discarded.
    pub truncated: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Spawns screened commands through `sh -c` with a hard timeout.
#[derive(Debug, Default)]
pub struct ShellRunner {
    max_output_bytes: usize,
    spawned: AtomicUsize,
}

impl ShellRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            max_output_bytes,
            spawned: AtomicUsize::new(0),
        }
    }

    /// Number of processes started so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub async fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutput> {
        screen_command(command)?;

        debug!(command, cwd = %cwd.display(), ?timeout, "Spawning command");
        let started = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let cap = self.max_output_bytes;
        let stdout = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(command, ?timeout, "Command timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out command");
                }
                for handle in [stdout, stderr].into_iter().flatten() {
                    handle.abort();
                }
                return Err(Error::Timeout(timeout));
            }
        };

        let (stdout, out_truncated) = join_reader(stdout).await?;
        let (stderr, err_truncated) = join_reader(stderr).await?;

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            truncated: out_truncated || err_truncated,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

async fn join_reader(
    handle: Option<tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>>,
) -> Result<(String, bool)> {
    match handle {
        Some(handle) => {
            let (bytes, truncated) = handle.await.map_err(|e| Error::TaskJoin(e.to_string()))??;
            Ok((String::from_utf8_lossy(&bytes).into_owned(), truncated))
        }
        None => Ok((String::new(), false)),
    }
}

/// Read to EOF, keeping at most `cap` bytes and draining the rest so the
/// child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if room >= n {
            kept.extend_from_slice(&buf[..n]);
        } else {
            kept.extend_from_slice(&buf[..room]);
            truncated = true;
        }
    }
    Ok((kept, truncated))
}
