//! Scratch copies of the working tree with pending changes laid over it.
//!
//! Tests for a generated change run inside such a copy so the working tree
//! is never touched before approval. Files the ignore rules admit are
//! copied; top-level entries they skip (dependency folders, build output,
//! dotfiles) are symlinked so test runners still find them.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Directory under the root that holds every scratch copy.
pub const STAGING_DIR: &str = ".devpilot/staging";

/// Copies larger than this are refused.
pub const MAX_STAGED_FILES: usize = 20_000;

/// Root-level names never copied or linked into a stage.
const NEVER_STAGED: &[&str] = &[".git", ".devpilot"];

/// New content for a path, or `None` to remove it from the copy.
pub type Overlay = Vec<(String, Option<String>)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub copied: usize,
    pub linked: usize,
    pub overlaid: usize,
}

/// Whether `rel` (root-relative) names a directory inside the staging area.
pub fn is_stage_path(rel: &str) -> bool {
    rel.strip_prefix(STAGING_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| !rest.is_empty() && !rest.contains('/'))
        .unwrap_or(false)
}

/// Copy `root` into `dest` and apply `overlay`. Overlay paths must already
/// be root-relative and free of traversal.
pub(crate) fn build(root: &Path, dest: &Path, files: Vec<PathBuf>, overlay: &Overlay) -> Result<StageSummary> {
    if files.len() > MAX_STAGED_FILES {
        return Err(Error::Validation(format!(
            "working tree has more than {} files, refusing to stage it",
            MAX_STAGED_FILES
        )));
    }
    std::fs::create_dir_all(dest)?;
    let mut summary = StageSummary::default();

    let mut present: HashSet<String> = HashSet::new();
    for file in files {
        let Ok(rel) = file.strip_prefix(root) else {
            continue;
        };
        let Some(first) = first_component(rel) else {
            continue;
        };
        if NEVER_STAGED.contains(&first.as_str()) {
            continue;
        }
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&file, &target)?;
        present.insert(first);
        summary.copied += 1;
    }

    // Overlaid top-level names must be real directories in the copy, or
    // writes would land in the working tree through a link.
    let overlaid: HashSet<String> = overlay
        .iter()
        .filter_map(|(path, _)| first_component(Path::new(path)))
        .collect();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if NEVER_STAGED.contains(&name.as_str()) || present.contains(&name) || overlaid.contains(&name) {
            continue;
        }
        if link(&entry.path(), &dest.join(&name))? {
            summary.linked += 1;
        }
    }

    for (path, content) in overlay {
        let target = dest.join(path);
        match content {
            Some(content) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, content)?;
            }
            None => match std::fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        summary.overlaid += 1;
    }
    Ok(summary)
}

fn first_component(path: &Path) -> Option<String> {
    path.components().find_map(|c| match c {
        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
        _ => None,
    })
}

#[cfg(unix)]
fn link(original: &Path, at: &Path) -> Result<bool> {
    std::os::unix::fs::symlink(original, at)?;
    Ok(true)
}

#[cfg(not(unix))]
fn link(_original: &Path, _at: &Path) -> Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_stage_path() {
        assert!(is_stage_path(".devpilot/staging/abc"));
        assert!(!is_stage_path(".devpilot/staging"));
        assert!(!is_stage_path(".devpilot/staging/"));
        assert!(!is_stage_path(".devpilot/staging/abc/src"));
        assert!(!is_stage_path(".devpilot/stagingx/abc"));
        assert!(!is_stage_path("src"));
    }

    #[test]
    fn test_build_copies_links_and_overlays() {
        let root = TempDir::new().unwrap();
        let r = root.path();
        std::fs::create_dir_all(r.join("src")).unwrap();
        std::fs::create_dir_all(r.join("node_modules/dep")).unwrap();
        std::fs::create_dir_all(r.join(".git")).unwrap();
        std::fs::write(r.join("src/app.ts"), "old\n").unwrap();
        std::fs::write(r.join("src/gone.ts"), "bye\n").unwrap();
        std::fs::write(r.join("node_modules/dep/index.js"), "dep\n").unwrap();

        let dest = r.join(STAGING_DIR).join("s1");
        let files = vec![r.join("src/app.ts"), r.join("src/gone.ts")];
        let overlay: Overlay = vec![
            ("src/app.ts".into(), Some("new\n".into())),
            ("src/gone.ts".into(), None),
            ("server/health.ts".into(), Some("ok\n".into())),
        ];
        let summary = build(r, &dest, files, &overlay).unwrap();

        assert_eq!(summary.copied, 2);
        assert_eq!(summary.overlaid, 3);
        assert_eq!(std::fs::read_to_string(dest.join("src/app.ts")).unwrap(), "new\n");
        assert!(!dest.join("src/gone.ts").exists());
        assert_eq!(std::fs::read_to_string(dest.join("server/health.ts")).unwrap(), "ok\n");
        assert!(!dest.join(".git").exists());
        assert!(!dest.join(".devpilot").exists());

        // The working tree is untouched.
        assert_eq!(std::fs::read_to_string(r.join("src/app.ts")).unwrap(), "old\n");
        assert!(r.join("src/gone.ts").exists());
        assert!(!r.join("server").exists());

        #[cfg(unix)]
        {
            assert_eq!(summary.linked, 1);
            assert_eq!(std::fs::read_to_string(dest.join("node_modules/dep/index.js")).unwrap(), "dep\n");
        }
    }

    #[test]
    fn test_build_refuses_huge_trees() {
        let root = TempDir::new().unwrap();
        let files = vec![root.path().join("a"); MAX_STAGED_FILES + 1];
        let err = build(root.path(), &root.path().join("dest"), files, &Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
