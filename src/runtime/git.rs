//! Git worktree lifecycle: deterministic worktree paths, branch and
//! worktree creation/removal, and worktree-to-branch lookup.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;

use super::exec::{ExecError, ExecOutput, run_with_timeout};

/// Budget for read-only checks (`rev-parse`, `worktree list`).
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for mutations (`branch`, `worktree add/remove`).
const MUTATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Repository not found at: {0}")]
    RepoNotFound(PathBuf),

    #[error("Branch '{branch}' not found in {repo}")]
    BranchNotFound { repo: PathBuf, branch: String },

    #[error("worktree error: {0}")]
    Worktree(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("git: {0}")]
    Runtime(String),
}

impl From<ExecError> for GitError {
    fn from(e: ExecError) -> Self {
        GitError::Runtime(e.to_string())
    }
}

fn git(repo: &Path, args: &[&str], timeout: Duration) -> Result<ExecOutput, ExecError> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo).args(args);
    run_with_timeout(cmd, timeout)
}

/// Derive the deterministic worktree path for a task:
/// `<worktrees_root>/<repo-name>/<task-id>`. The default root is
/// `~/documents/repos/worktrees`.
pub fn derive_worktree_path(
    repo: &Path,
    task_id: &str,
    worktrees_root: Option<&Path>,
) -> Result<PathBuf, GitError> {
    if !repo.is_absolute() {
        return Err(GitError::InvalidArgument(format!(
            "repo path must be absolute, got: {}",
            repo.display()
        )));
    }
    if task_id.trim().is_empty() {
        return Err(GitError::InvalidArgument(
            "task id cannot be empty".to_string(),
        ));
    }

    let root = match worktrees_root {
        Some(root) => root.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| GitError::Runtime("could not determine home directory".to_string()))?
            .join("documents")
            .join("repos")
            .join("worktrees"),
    };
    let repo_name = repo
        .file_name()
        .ok_or_else(|| GitError::InvalidArgument(format!("unusable repo path: {}", repo.display())))?;

    Ok(root.join(repo_name).join(task_id))
}

/// Whether a git repository lives at the path (a `.git` subtree exists).
pub fn repo_exists(repo: &Path) -> bool {
    repo.join(".git").exists()
}

fn ensure_repo_exists(repo: &Path) -> Result<(), GitError> {
    if repo_exists(repo) {
        Ok(())
    } else {
        Err(GitError::RepoNotFound(repo.to_path_buf()))
    }
}

/// Whether a branch exists in the repository.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool, GitError> {
    ensure_repo_exists(repo)?;
    let output = git(repo, &["rev-parse", "--verify", branch], CHECK_TIMEOUT)?;
    Ok(output.success())
}

pub fn ensure_branch_exists(repo: &Path, branch: &str) -> Result<(), GitError> {
    if branch_exists(repo, branch)? {
        Ok(())
    } else {
        Err(GitError::BranchNotFound {
            repo: repo.to_path_buf(),
            branch: branch.to_string(),
        })
    }
}

/// Create `branch` from `base`. Idempotent when the branch already exists;
/// fails when the base does not.
pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<(), GitError> {
    ensure_repo_exists(repo)?;
    ensure_branch_exists(repo, base)?;

    if branch_exists(repo, branch)? {
        return Ok(());
    }

    let output = git(repo, &["branch", branch, base], MUTATE_TIMEOUT)?;
    if !output.success() {
        return Err(GitError::Runtime(format!(
            "failed to create branch '{branch}' from '{base}': {}",
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Create a worktree at `worktree_path` on `branch`, creating the branch
/// from `base` when missing. Returns the path unchanged when it already
/// exists.
pub fn create_worktree(
    repo: &Path,
    worktree_path: &Path,
    branch: &str,
    base: &str,
) -> Result<PathBuf, GitError> {
    ensure_repo_exists(repo)?;
    ensure_branch_exists(repo, base)?;

    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::Worktree(format!("failed to create parent dirs: {e}")))?;
    }

    if !branch_exists(repo, branch)? {
        create_branch(repo, branch, base)?;
    }

    let wt = worktree_path.to_string_lossy();
    let output = git(repo, &["worktree", "add", wt.as_ref(), branch], MUTATE_TIMEOUT)
        .map_err(|e| GitError::Worktree(e.to_string()))?;

    if !output.success() {
        // The add can lose a race with an earlier run of the same task;
        // an existing path is treated as already created.
        if worktree_path.exists() {
            return Ok(worktree_path.to_path_buf());
        }
        return Err(GitError::Worktree(format!(
            "failed to create worktree at {}: {}",
            worktree_path.display(),
            output.stderr.trim()
        )));
    }

    Ok(worktree_path.to_path_buf())
}

/// Remove a worktree. A missing path is a no-op.
pub fn remove_worktree(repo: &Path, worktree_path: &Path, force: bool) -> Result<(), GitError> {
    ensure_repo_exists(repo)?;

    if !worktree_path.exists() {
        return Ok(());
    }

    let wt = worktree_path.to_string_lossy();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(wt.as_ref());

    let output = git(repo, &args, MUTATE_TIMEOUT).map_err(|e| GitError::Worktree(e.to_string()))?;
    if !output.success() {
        return Err(GitError::Worktree(format!(
            "failed to remove worktree {}: {}",
            worktree_path.display(),
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Resolve the branch checked out in a worktree by parsing
/// `git worktree list --porcelain`. Returns `None` for detached or
/// unknown worktrees.
pub fn get_branch_from_worktree(repo: &Path, worktree_path: &Path) -> Result<Option<String>, GitError> {
    ensure_repo_exists(repo)?;

    let output = match git(repo, &["worktree", "list", "--porcelain"], CHECK_TIMEOUT) {
        Ok(output) if output.success() => output,
        _ => return Ok(None),
    };

    let target_path = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());
    let target = target_path.to_string_lossy();
    let mut current_matches = false;
    let mut current_branch: Option<String> = None;
    let mut current_detached = false;

    for line in output.stdout.lines().chain(std::iter::once("")) {
        let line = line.trim();
        if line.is_empty() {
            if current_matches {
                return Ok(if current_detached { None } else { current_branch });
            }
            current_matches = false;
            current_branch = None;
            current_detached = false;
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            current_matches = path == target;
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            current_branch = branch_ref
                .strip_prefix("refs/heads/")
                .map(ToString::to_string);
        } else if line == "detached" {
            current_detached = true;
        }
    }

    Ok(None)
}
