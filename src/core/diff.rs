//! Line diffs between original and generated content.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

/// Diff of one file. Only ever built from the two contents it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub unified: String,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl FileDiff {
    pub fn between(path: &str, old: &str, new: &str) -> Self {
        let diff = TextDiff::from_lines(old, new);
        let unified = diff
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{}", path), &format!("b/{}", path))
            .to_string();

        let (mut lines_added, mut lines_removed) = (0, 0);
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => lines_added += 1,
                ChangeTag::Delete => lines_removed += 1,
                ChangeTag::Equal => {}
            }
        }

        Self {
            unified,
            lines_added,
            lines_removed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines_added == 0 && self.lines_removed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_counts() {
        let diff = FileDiff::between("src/a.ts", "one\ntwo\n", "one\nthree\nfour\n");
        assert_eq!(diff.lines_added, 2);
        assert_eq!(diff.lines_removed, 1);
        assert!(diff.unified.contains("--- a/src/a.ts"));
        assert!(diff.unified.contains("+++ b/src/a.ts"));
        assert!(diff.unified.contains("-two"));
        assert!(diff.unified.contains("+three"));
    }

    #[test]
    fn test_identical_content_is_empty() {
        let diff = FileDiff::between("x", "same\n", "same\n");
        assert!(diff.is_empty());
    }

    #[test]
    fn test_create_diff_is_all_insertions() {
        let diff = FileDiff::between("new.ts", "", "a\nb\n");
        assert_eq!(diff.lines_added, 2);
        assert_eq!(diff.lines_removed, 0);
    }
}
