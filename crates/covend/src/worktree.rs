//! Worktree lifecycle for a workflow (spec Section 4.3, 4.6).
//!
//! One git worktree per in-flight workflow, checked out on a branch derived
//! from the task and workflow id, isolating agent/script execution from the
//! primary working tree and from sibling workflows.

use std::path::{Path, PathBuf};
use thiserror::Error;

use coven_core::config::Config;

use crate::git;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// A prepared worktree: branch name and filesystem path, ready for the
/// Interpreter to run steps in.
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub base_branch: String,
    pub run_branch: String,
    pub worktree_path: PathBuf,
}

/// Create a worktree for a workflow. The branch is derived from
/// `run_branch_prefix` and a sanitized workflow id, keeping every workflow's
/// branch name collision-free.
pub fn prepare(workspace_root: &Path, config: &Config, workflow_id: &str) -> Result<WorktreeHandle> {
    let base_branch = config
        .base_branch
        .clone()
        .unwrap_or_else(|| git::detect_default_branch(workspace_root).unwrap_or_else(|_| "main".to_string()));

    let run_branch = format!("{}{}", config.run_branch_prefix, git::sanitize_branch_name(workflow_id));

    let expanded = git::expand_worktree_template(&config.worktree_path_template, workspace_root, workflow_id, &run_branch);
    let worktree_path = git::resolve_worktree_path(&expanded, workspace_root);

    git::create_worktree(workspace_root, &worktree_path, &run_branch, &base_branch)?;

    Ok(WorktreeHandle { base_branch, run_branch, worktree_path })
}

/// Remove a workflow's worktree. Failures are logged but never fail an
/// otherwise-terminal workflow (spec Section 4.6: cleanup runs best-effort
/// regardless of workflow outcome).
pub fn cleanup(workspace_root: &Path, handle: &WorktreeHandle) {
    if let Err(e) = git::remove_worktree(workspace_root, &handle.worktree_path, true) {
        tracing::warn!(worktree = %handle.worktree_path.display(), error = %e, "worktree cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        Command::new("git").args(["init"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.email", "test@test.com"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.name", "Test"]).current_dir(dir.path()).output().unwrap();
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "Initial commit"]).current_dir(dir.path()).output().unwrap();
        dir
    }

    #[test]
    fn prepare_and_cleanup_round_trip() {
        let dir = setup_test_repo();
        let mut config = Config::default();
        config.worktree_path_template = "../{{ repo }}.{{ branch | sanitize }}".to_string();

        let handle = prepare(dir.path(), &config, "wf-1").unwrap();
        assert!(handle.worktree_path.exists());
        assert_eq!(handle.run_branch, "coven-wf-1");

        cleanup(dir.path(), &handle);
        assert!(!handle.worktree_path.exists());
    }
}
