//! Confinement of path arguments to the working root.
//!
//! Lexical checks (decoding, separators, traversal, NUL) run before any
//! filesystem access. Only a lexically clean path is then checked against
//! symlinks by canonicalizing its nearest existing ancestor.

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Rounds of percent-decoding applied, so `%252e` cannot smuggle a dot.
const MAX_DECODE_ROUNDS: usize = 3;

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `raw` to an absolute path inside the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let cleaned = lexical_clean(raw)?;
        let candidate = if is_absolute(&cleaned) {
            PathBuf::from(&cleaned)
        } else {
            self.root.join(&cleaned)
        };
        let normalized = normalize(&candidate);
        if !normalized.starts_with(&self.root) {
            return Err(Error::path(raw, "resolves outside the working root"));
        }
        self.check_symlinks(raw, &normalized)?;
        Ok(normalized)
    }

    /// Root-relative form of a resolved path, with forward slashes.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn check_symlinks(&self, raw: &str, path: &Path) -> Result<()> {
        let mut ancestor = Some(path);
        while let Some(p) = ancestor {
            if p.symlink_metadata().is_ok() {
                let real = p.canonicalize().map_err(|_| {
                    Error::path(raw, "cannot resolve existing path component")
                })?;
                if !real.starts_with(&self.root) {
                    return Err(Error::path(raw, "symlink escapes the working root"));
                }
                return Ok(());
            }
            ancestor = p.parent();
        }
        Err(Error::path(raw, "no existing ancestor inside the working root"))
    }
}

fn lexical_clean(raw: &str) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(Error::path(raw, "empty path"));
    }
    let mut decoded = raw.to_string();
    for _ in 0..MAX_DECODE_ROUNDS {
        let next = urlencoding::decode(&decoded)
            .map_err(|_| Error::path(raw, "invalid percent-encoding"))?
            .into_owned();
        if next == decoded {
            break;
        }
        decoded = next;
    }
    if decoded.contains('%') && urlencoding::decode(&decoded).map(|d| d != decoded).unwrap_or(true) {
        return Err(Error::path(raw, "excessive percent-encoding"));
    }
    if decoded.contains('\0') {
        return Err(Error::path(raw, "NUL byte in path"));
    }
    let unified = decoded.replace('\\', "/");
    if unified.split('/').any(|segment| segment.trim() == "..") {
        return Err(Error::path(raw, "path traversal"));
    }
    if unified.len() >= 2 && unified.as_bytes()[1] == b':' && !unified.starts_with('/') {
        return Err(Error::path(raw, "drive-qualified path"));
    }
    Ok(unified)
}

fn is_absolute(cleaned: &str) -> bool {
    cleaned.starts_with('/')
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
