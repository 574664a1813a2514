//! Git operations for task branches and integration merges.
//!
//! Each assigned task works in its own worktree on its own branch; once the
//! task's change set passes isolated validation the engine merges the branch
//! into the integration branch. Conflicts are surfaced as data, not errors,
//! so the engine can fail the task and retry instead of aborting the run.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, MergeOptions, Repository, Signature};

use crate::error::Result;
use crate::{mlog_debug, mlog_warn};

/// Result of merging a task branch into the integration branch.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Merge landed; the integration branch now points at `commit`.
    Merged { commit: String },
    /// The merge has textual conflicts in these files.
    Conflicts { files: Vec<String> },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }
}

pub struct RepoOps {
    repo_path: PathBuf,
}

impl RepoOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        mlog_debug!("RepoOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Maestro", "maestro@localhost"))?)
    }

    /// Create a task worktree on a fresh branch cut from `base` (or HEAD
    /// when `base` does not exist yet).
    pub fn create_worktree(&self, branch: &str, base: &str, worktree_path: &Path) -> Result<()> {
        mlog_debug!(
            "RepoOps::create_worktree branch={} base={} path={}",
            branch,
            base,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let base_commit = match repo.find_branch(base, git2::BranchType::Local) {
            Ok(b) => b.into_reference().peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => repo.head()?.peel_to_commit()?,
            Err(e) => return Err(e.into()),
        };
        let branch_obj = repo.branch(branch, &base_commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Use the folder name as the worktree name (branch may contain slashes).
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and its admin directory.
    ///
    /// Attempts cleanup even when individual steps fail; a stale admin dir
    /// would make git believe the branch is still checked out.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        mlog_debug!("RepoOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    mlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        if let Some(ref name) = worktree_name {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Stage and commit everything in a worktree; returns the commit id.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        mlog_debug!(
            "RepoOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(commit_id.to_string())
    }

    /// Whether a worktree has uncommitted changes (staged or unstaged).
    pub fn is_dirty(worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    }

    /// Create a worktree on a fresh branch cut from an exact commit.
    ///
    /// Used for composition probes, which must start from the recorded
    /// base rather than whatever a branch tip has moved to.
    pub fn create_worktree_at(
        &self,
        branch: &str,
        commit: &str,
        worktree_path: &Path,
    ) -> Result<()> {
        let repo = self.repo()?;
        let oid = git2::Oid::from_str(commit)?;
        let base_commit = repo.find_commit(oid)?;
        let branch_obj = repo.branch(branch, &base_commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Merge a branch into the branch checked out in `worktree_path`.
    ///
    /// Fast-forwards when possible, otherwise makes a merge commit. On
    /// conflicts the merge state is cleaned up and the conflicted paths
    /// are returned; the worktree is left as it was.
    pub fn merge_branch(&self, worktree_path: &Path, branch: &str) -> Result<MergeOutcome> {
        let repo = Repository::open(worktree_path)?;
        let their_commit = repo
            .find_branch(branch, git2::BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let head_ref = repo.head()?;
        let our_commit = head_ref.peel_to_commit()?;
        let refname = head_ref
            .name()
            .map(|s| s.to_string())
            .ok_or_else(|| git2::Error::from_str("worktree HEAD is not a named reference"))?;

        let their_annotated = repo.find_annotated_commit(their_commit.id())?;
        let (analysis, _preference) = repo.merge_analysis(&[&their_annotated])?;

        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::Merged {
                commit: our_commit.id().to_string(),
            });
        }

        if analysis.is_fast_forward() {
            repo.reference(
                &refname,
                their_commit.id(),
                true,
                &format!("fast-forward to {}", branch),
            )?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
            return Ok(MergeOutcome::Merged {
                commit: their_commit.id().to_string(),
            });
        }

        let mut merge_opts = MergeOptions::new();
        repo.merge(&[&their_annotated], Some(&mut merge_opts), None)?;

        let index = repo.index()?;
        if index.has_conflicts() {
            let files = Self::conflicted_paths(&repo)?;
            let _ = repo.cleanup_state();
            repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
            mlog_warn!(
                "Merge of {} into {} conflicted: {:?}",
                branch,
                refname,
                files
            );
            return Ok(MergeOutcome::Conflicts { files });
        }

        let sig = Self::signature(&repo)?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let message = format!("merge {} into {}", branch, refname);
        let commit_id = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[&our_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;

        Ok(MergeOutcome::Merged {
            commit: commit_id.to_string(),
        })
    }

    fn conflicted_paths(repo: &Repository) -> Result<Vec<String>> {
        let index = repo.index()?;
        let mut files = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).to_string())
                .unwrap_or_default();
            files.push(path);
        }
        Ok(files)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        // Branch borrows repo; resolve before the tail expression so the
        // borrow ends inside the function body.
        let exists = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(exists)
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut b) => b.delete()?,
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Commit id of a branch tip.
    pub fn branch_head(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let b = repo.find_branch(branch, git2::BranchType::Local)?;
        let id = b.into_reference().peel_to_commit()?.id().to_string();
        Ok(id)
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let id = repo.head()?.peel_to_commit()?.id().to_string();
        Ok(id)
    }
}

impl std::fmt::Debug for RepoOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoOps")
            .field("repo_path", &self.repo_path)
            .finish()
    }
}
