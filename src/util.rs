//! Shared utility functions.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Truncate to at most `max` chars, appending a marker when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n…[truncated]", &s[..idx]),
        None => s.to_string(),
    }
}

fn secret_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                "credential assignment",
                r#"(?i)\b(api[_-]?key|secret|password|passwd|access[_-]?token|auth[_-]?token)\b["']?\s*[:=]\s*["'][^"'\s]{8,}["']"#,
            ),
            ("OpenAI-style key", r"\bsk-[A-Za-z0-9_-]{20,}"),
            ("AWS access key", r"\bAKIA[0-9A-Z]{16}\b"),
            ("GitHub token", r"\bgh[pousr]_[A-Za-z0-9]{36,}"),
            ("private key", r"-----BEGIN (RSA |EC |OPENSSH )?PRIVATE KEY-----"),
        ]
        .into_iter()
        .filter_map(|(label, re)| Regex::new(re).ok().map(|re| (label, re)))
        .collect()
    })
}

/// Kind of hardcoded credential found in `text`, if any.
pub fn find_secret(text: &str) -> Option<&'static str> {
    secret_patterns()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(label, _)| *label)
}
