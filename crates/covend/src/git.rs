//! Git operations for the daemon: worktree creation, branch naming, and the
//! merge-back performed by a `merge` step (spec Section 4.6).

use coven_core::config::MergeStrategy;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Filesystem- and branch-name-safe slug: lowercase alphanumerics joined by
/// single hyphens, slashes included as separators.
pub fn sanitize_branch_name(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Detect the default branch for a repository.
///
/// Tries `git symbolic-ref refs/remotes/origin/HEAD` first (tracks remote
/// default), then falls back to `main`/`master`.
pub fn detect_default_branch(workspace_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(workspace_root)
        .output()?;

    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    let main_check = Command::new("git")
        .args(["rev-parse", "--verify", "refs/heads/main"])
        .current_dir(workspace_root)
        .output()?;
    if main_check.status.success() {
        return Ok("main".to_string());
    }

    let master_check = Command::new("git")
        .args(["rev-parse", "--verify", "refs/heads/master"])
        .current_dir(workspace_root)
        .output()?;
    if master_check.status.success() {
        return Ok("master".to_string());
    }

    Ok("main".to_string())
}

/// Get the repository directory name from workspace root.
pub fn repo_name(workspace_root: &Path) -> String {
    workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Expand the worktree path template (spec Section 3, `worktree_path_template`).
///
/// Template variables: `{{ repo }}`, `{{ workflow_id }}`, `{{ branch }}` and
/// `{{ branch | sanitize }}`.
pub fn expand_worktree_template(
    template: &str,
    workspace_root: &Path,
    workflow_id: &str,
    branch: &str,
) -> String {
    let repo = repo_name(workspace_root);
    let sanitized = sanitize_branch_name(branch);

    template
        .replace("{{ repo }}", &repo)
        .replace("{{repo}}", &repo)
        .replace("{{ workflow_id }}", workflow_id)
        .replace("{{workflow_id}}", workflow_id)
        .replace("{{ branch | sanitize }}", &sanitized)
        .replace("{{branch | sanitize}}", &sanitized)
        .replace("{{ branch }}", branch)
        .replace("{{branch}}", branch)
}

/// Resolve the worktree path to an absolute path, relative to the
/// workspace root's parent when not already absolute.
pub fn resolve_worktree_path(expanded: &str, workspace_root: &Path) -> std::path::PathBuf {
    let path = std::path::Path::new(expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root
            .join(expanded)
            .canonicalize()
            .unwrap_or_else(|_| normalize_path(&workspace_root.join(expanded)))
    }
}

fn normalize_path(path: &Path) -> std::path::PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

/// Check if a branch exists locally.
pub fn branch_exists(workspace_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(workspace_root)
        .output()?;
    Ok(output.status.success())
}

/// Create a new branch from base without checking it out.
pub fn create_branch(workspace_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["branch", branch, base])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git branch {branch} {base}: {stderr}")));
    }
    Ok(())
}

/// Create a git worktree at the given path for `branch`, creating the
/// branch from `base_branch` first if it does not yet exist.
pub fn create_worktree(
    workspace_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("failed to create parent directory: {e}")))?;
    }

    if !branch_exists(workspace_root, branch)? {
        create_branch(workspace_root, branch, base_branch)?;
    }

    let output = Command::new("git")
        .args(["worktree", "add", worktree_path.to_string_lossy().as_ref(), branch])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git worktree add: {stderr}")));
    }
    Ok(())
}

/// Remove a git worktree, forcing removal if it has local changes (spec
/// Section 4.6: worktree cleanup runs regardless of workflow outcome).
pub fn remove_worktree(workspace_root: &Path, worktree_path: &Path, force: bool) -> Result<()> {
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    let path_str = worktree_path.to_string_lossy();
    args.push(path_str.as_ref());

    let output = Command::new("git").args(&args).current_dir(workspace_root).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git worktree remove: {stderr}")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
}

/// List all git worktrees for a repository.
pub fn list_worktrees(workspace_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = Command::new("git")
        .args(["worktree", "list", "--porcelain"])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git worktree list: {stderr}")));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut worktrees = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_commit: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (current_path.take(), current_commit.take()) {
                worktrees.push(WorktreeInfo { path, commit, branch: current_branch.take() });
            }
            current_path = Some(path.to_string());
        } else if let Some(commit) = line.strip_prefix("HEAD ") {
            current_commit = Some(commit.to_string());
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        }
    }

    if let (Some(path), Some(commit)) = (current_path, current_commit) {
        worktrees.push(WorktreeInfo { path, commit, branch: current_branch });
    }

    Ok(worktrees)
}

/// Check if the working tree is clean (no uncommitted changes).
pub fn is_working_tree_clean(workspace_root: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git status: {stderr}")));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().is_empty())
}

pub fn checkout_branch(workspace_root: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git").args(["checkout", branch]).current_dir(workspace_root).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git checkout {branch}: {stderr}")));
    }
    Ok(())
}

/// Merge a source branch into the current branch with a real merge commit.
pub fn merge_branch(workspace_root: &Path, source_branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["merge", source_branch, "--no-edit"])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = Command::new("git").args(["merge", "--abort"]).current_dir(workspace_root).output();
            return Err(GitError::MergeConflict(format!("merge from {source_branch} failed: {stderr}")));
        }
        return Err(GitError::CommandFailed(format!("git merge {source_branch}: {stderr}")));
    }
    Ok(())
}

/// Squash merge a source branch into the current branch.
pub fn squash_merge_branch(workspace_root: &Path, source_branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["merge", "--squash", source_branch])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = Command::new("git").args(["reset", "--hard", "HEAD"]).current_dir(workspace_root).output();
            return Err(GitError::MergeConflict(format!("squash merge from {source_branch} failed: {stderr}")));
        }
        return Err(GitError::CommandFailed(format!("git merge --squash {source_branch}: {stderr}")));
    }

    let status_output = Command::new("git")
        .args(["diff", "--cached", "--quiet"])
        .current_dir(workspace_root)
        .output()?;
    if !status_output.status.success() {
        let commit_msg = format!("Squash merge from {source_branch}");
        let commit_output = Command::new("git")
            .args(["commit", "-m", &commit_msg])
            .current_dir(workspace_root)
            .output()?;
        if !commit_output.status.success() {
            let stderr = String::from_utf8_lossy(&commit_output.stderr);
            return Err(GitError::CommandFailed(format!("git commit after squash: {stderr}")));
        }
    }
    Ok(())
}

/// Rebase the current branch onto `source_branch` then fast-forward.
pub fn rebase_onto(workspace_root: &Path, source_branch: &str, target_branch: &str) -> Result<()> {
    checkout_branch(workspace_root, source_branch)?;
    let output = Command::new("git")
        .args(["rebase", target_branch])
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let _ = Command::new("git").args(["rebase", "--abort"]).current_dir(workspace_root).output();
        return Err(GitError::MergeConflict(format!("rebase onto {target_branch} failed: {stderr}")));
    }
    checkout_branch(workspace_root, target_branch)?;
    let ff = Command::new("git")
        .args(["merge", "--ff-only", source_branch])
        .current_dir(workspace_root)
        .output()?;
    if !ff.status.success() {
        let stderr = String::from_utf8_lossy(&ff.stderr);
        return Err(GitError::CommandFailed(format!("fast-forward {target_branch} onto {source_branch}: {stderr}")));
    }
    Ok(())
}

/// Perform the merge-back for a `merge` step (spec Section 4.6): merge the
/// workflow's run branch into `target_branch` using the configured strategy.
/// Leaves `target_branch` checked out in the primary worktree. Does not push.
pub fn merge_to_target(
    workspace_root: &Path,
    run_branch: &str,
    target_branch: &str,
    base_branch: &str,
    strategy: MergeStrategy,
) -> Result<()> {
    if !is_working_tree_clean(workspace_root)? {
        return Err(GitError::DirtyWorkingTree("cannot merge with uncommitted changes".to_string()));
    }

    if strategy == MergeStrategy::Rebase {
        return rebase_onto(workspace_root, run_branch, target_branch);
    }

    if !branch_exists(workspace_root, target_branch)? {
        create_branch(workspace_root, target_branch, base_branch)?;
    }
    checkout_branch(workspace_root, target_branch)?;

    let result = match strategy {
        MergeStrategy::Merge => merge_branch(workspace_root, run_branch),
        MergeStrategy::Squash => squash_merge_branch(workspace_root, run_branch),
        MergeStrategy::Rebase => unreachable!("handled above"),
    };

    if let Err(e) = &result {
        tracing::warn!(%run_branch, error = %e, "merge failed, run branch preserved for manual recovery");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
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
    fn sanitize_branch_name_collapses_separators() {
        assert_eq!(sanitize_branch_name("coven/fix-bug"), "coven-fix-bug");
        assert_eq!(sanitize_branch_name("Feature/Thing_1"), "feature-thing-1");
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name(Path::new("/home/user/my-project")), "my-project");
    }

    #[test]
    fn expand_worktree_template_substitutes_vars() {
        let template = "../{{ repo }}.{{ branch | sanitize }}";
        let expanded = expand_worktree_template(
            template,
            Path::new("/home/user/my-project"),
            "wf-1",
            "coven/feature-x",
        );
        assert_eq!(expanded, "../my-project.coven-feature-x");
    }

    #[test]
    fn test_normalize_path() {
        let path = normalize_path(Path::new("/home/user/project/../other"));
        assert_eq!(path, PathBuf::from("/home/user/other"));
    }

    #[test]
    fn test_resolve_worktree_path_absolute() {
        let resolved = resolve_worktree_path("/absolute/path", Path::new("/workspace"));
        assert_eq!(resolved, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_is_working_tree_clean() {
        let dir = setup_test_repo();
        assert!(is_working_tree_clean(dir.path()).unwrap());
        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn test_merge_to_target_creates_branch() {
        let dir = setup_test_repo();

        create_branch(dir.path(), "coven/test", "HEAD").unwrap();
        checkout_branch(dir.path(), "coven/test").unwrap();
        std::fs::write(dir.path().join("run.txt"), "run content").unwrap();
        Command::new("git").args(["add", "run.txt"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "workflow changes"]).current_dir(dir.path()).output().unwrap();

        let main_branch = detect_default_branch(dir.path()).unwrap();
        checkout_branch(dir.path(), &main_branch).unwrap();

        merge_to_target(dir.path(), "coven/test", "main", &main_branch, MergeStrategy::Squash).unwrap();

        assert!(dir.path().join("run.txt").exists());
    }

    #[test]
    fn test_merge_to_target_dirty_tree_fails() {
        let dir = setup_test_repo();
        std::fs::write(dir.path().join("dirty.txt"), "uncommitted").unwrap();

        let main_branch = detect_default_branch(dir.path()).unwrap();
        let result = merge_to_target(dir.path(), "nonexistent", "target", &main_branch, MergeStrategy::Merge);

        assert!(matches!(result, Err(GitError::DirtyWorkingTree(_))));
    }
}
