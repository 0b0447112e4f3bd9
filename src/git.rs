use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, ResetType, Signature, Status, StatusOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// One entry of `git status`, relative to the repository workdir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub path: String,
    pub state: String,
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Like `new`, but returns `None` when the path is not inside a repository.
    pub fn discover(repo_path: &Path) -> Option<Self> {
        Self::new(repo_path).ok()
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create a local branch at HEAD. Existing names are an error, never a reset.
    pub fn create_branch(&self, branch: &str) -> Result<String> {
        debug!(branch, "GitOps::create_branch");
        if branch.trim().is_empty() {
            return Err(Error::Validation("branch name must not be empty".into()));
        }
        if self.branch_exists(branch)? {
            return Err(Error::BranchExists(branch.to_string()));
        }
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        let created = repo.branch(branch, &commit, false);
        match created {
            Ok(_) => Ok(commit.id().to_string()),
            Err(e) if e.code() == ErrorCode::Exists => Err(Error::BranchExists(branch.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage everything and commit on HEAD. Returns the new commit id.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        debug!(message, "GitOps::commit_all");
        let repo = self.repo()?;
        let mut index = repo.index()?;
        // Scratch files under .devpilot never belong in a commit.
        let mut skip_scratch = |path: &Path, _spec: &[u8]| -> i32 {
            if path.starts_with(".devpilot") {
                1
            } else {
                0
            }
        };
        index.add_all(
            ["."].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut skip_scratch as &mut git2::IndexMatchedPath),
        )?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("devpilot", "devpilot@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %commit_id, "Commit created");
        Ok(commit_id.to_string())
    }

    /// Full id of the HEAD commit, or `None` on an unborn branch.
    pub fn head_commit(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let id = head.peel_to_commit()?.id().to_string();
        Ok(Some(id))
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(head.is_branch().then(|| head.shorthand().map(String::from)).flatten())
    }

    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter_map(|entry| {
                let path = entry.path()?.to_string();
                Some(StatusEntry {
                    path,
                    state: describe_status(entry.status()).to_string(),
                })
            })
            .collect())
    }

    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status()?.is_empty())
    }

    /// Move HEAD and the index back to `commit`, leaving the worktree alone.
    /// File bytes are restored separately from the snapshot.
    pub fn reset_mixed(&self, commit: &str) -> Result<()> {
        debug!(commit, "GitOps::reset_mixed");
        let repo = self.repo()?;
        let target = repo.find_commit(Oid::from_str(commit)?)?;
        repo.reset(target.as_object(), ResetType::Mixed, None)?;
        Ok(())
    }
}

fn describe_status(status: Status) -> &'static str {
    if status.contains(Status::CONFLICTED) {
        "conflicted"
    } else if status.intersects(Status::WT_NEW | Status::INDEX_NEW) {
        "new"
    } else if status.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
        "deleted"
    } else if status.intersects(Status::WT_RENAMED | Status::INDEX_RENAMED) {
        "renamed"
    } else if status.intersects(Status::WT_MODIFIED | Status::INDEX_MODIFIED | Status::WT_TYPECHANGE | Status::INDEX_TYPECHANGE) {
        "modified"
    } else {
        "unknown"
    }
}
