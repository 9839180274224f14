//! `taskq add`: register a task from inline text or a task file.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};

use crate::paths::QueuePaths;
use crate::runtime::git;
use crate::store::TaskRecord;
use crate::task_file::{
    canonical_task_document, derive_id_from_filename, parse_header_optional, read_task_file,
    resolve_repo_path, write_task_file,
};
use crate::naming;

use super::open_store;

#[derive(Debug, Default)]
pub struct AddOptions {
    pub id: Option<String>,
    pub repo: Option<String>,
    pub base: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub task: Option<String>,
    pub task_file: Option<String>,
}

/// Values resolved from either the task-file header or the CLI flags.
struct ResolvedTask {
    id: String,
    repo: PathBuf,
    base: String,
    branch: String,
    worktree_path: PathBuf,
    task_file_value: String,
}

pub fn add(paths: &QueuePaths, opts: &AddOptions) -> Result<i32> {
    let store = open_store(paths)?;

    let id_arg = trimmed(&opts.id);
    let repo_arg = trimmed(&opts.repo);
    let base_arg = trimmed(&opts.base);
    let branch_arg = trimmed(&opts.branch);
    let worktree_arg = trimmed(&opts.worktree_path);

    let resolved = match (&opts.task, &opts.task_file) {
        (Some(task), None) => from_inline_task(
            paths,
            &store,
            task,
            id_arg,
            repo_arg,
            base_arg,
            branch_arg,
            worktree_arg,
        )?,
        (None, Some(source)) => from_task_file(
            paths,
            &store,
            source,
            id_arg,
            repo_arg,
            base_arg,
            branch_arg,
            worktree_arg,
        )?,
        _ => bail!("exactly one of --task / --task-file is required"),
    };

    let record = TaskRecord::new_todo(
        resolved.id.clone(),
        resolved.repo.display().to_string(),
        resolved.base,
        resolved.task_file_value,
        resolved.branch,
        resolved.worktree_path.display().to_string(),
    );
    store.add(record)?;

    println!("Task added to queue: {}", resolved.id);
    Ok(0)
}

#[expect(clippy::too_many_arguments)]
fn from_inline_task(
    paths: &QueuePaths,
    store: &crate::store::QueueStore,
    task: &str,
    id_arg: Option<&str>,
    repo_arg: Option<&str>,
    base_arg: Option<&str>,
    branch_arg: Option<&str>,
    worktree_arg: Option<&str>,
) -> Result<ResolvedTask> {
    let task_id = id_arg.ok_or_else(|| anyhow!("--id is required when using --task"))?;
    let repo = repo_arg.ok_or_else(|| anyhow!("--repo is required when using --task"))?;

    ensure_new_id(store, task_id)?;

    let base = base_arg.unwrap_or("main");
    let content =
        canonical_task_document(task_id, repo, task, base, branch_arg, worktree_arg)?;
    let canonical_path = write_task_file(task_id, &content, &paths.tasks_dir())?;
    let (frontmatter, _) = read_task_file(task_id, &paths.tasks_dir())?;

    let branch = branch_arg
        .map(ToString::to_string)
        .or_else(|| non_empty(&frontmatter.branch))
        .unwrap_or_else(|| naming::derive_branch_name(task_id));
    let worktree_path = resolve_worktree(
        worktree_arg,
        non_empty(&frontmatter.worktree_path).as_deref(),
        &frontmatter.repo,
        task_id,
    )?;

    println!("Task file created: {}", canonical_path.display());

    Ok(ResolvedTask {
        id: task_id.to_string(),
        repo: frontmatter.repo,
        base: frontmatter.base,
        branch,
        worktree_path,
        task_file_value: format!("queue/tasks/{task_id}.md"),
    })
}

#[expect(clippy::too_many_arguments)]
fn from_task_file(
    paths: &QueuePaths,
    store: &crate::store::QueueStore,
    source: &str,
    id_arg: Option<&str>,
    repo_arg: Option<&str>,
    base_arg: Option<&str>,
    branch_arg: Option<&str>,
    worktree_arg: Option<&str>,
) -> Result<ResolvedTask> {
    let source_path = absolutize(Path::new(source))?;
    if !source_path.exists() {
        bail!("Failed to process task file: Source file not found: {}", source_path.display());
    }

    let content = std::fs::read_to_string(&source_path)?;
    let (header, _) = parse_header_optional(&content)
        .map_err(|e| anyhow!("Failed to process task file: {e}"))?;
    let header = header.unwrap_or_default();

    let task_id = match id_arg {
        Some(id) => id.to_string(),
        None => match header.id.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(id) => id.to_string(),
            None => derive_id_from_filename(&source_path)?,
        },
    };
    ensure_new_id(store, &task_id)?;

    let repo_value = repo_arg
        .map(ToString::to_string)
        .or_else(|| header.repo.clone().filter(|s| !s.trim().is_empty()))
        .ok_or_else(|| {
            anyhow!("Failed to process task file: missing repo (provide --repo or a header repo)")
        })?;
    let resolved_repo = resolve_repo_path(&repo_value)
        .map_err(|e| anyhow!("Failed to process task file: {e}"))?;

    let base = base_arg
        .map(ToString::to_string)
        .or_else(|| header.base.clone().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| "main".to_string());
    let branch = branch_arg
        .map(ToString::to_string)
        .or_else(|| header.branch.clone().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| naming::derive_branch_name(&task_id));
    let worktree_path = resolve_worktree(
        worktree_arg,
        header
            .worktree_path
            .as_deref()
            .filter(|s| !s.trim().is_empty()),
        &resolved_repo,
        &task_id,
    )?;

    let task_file_value = display_relative_to_root(paths, &source_path);
    println!("Task file registered: {task_file_value}");

    Ok(ResolvedTask {
        id: task_id,
        repo: resolved_repo,
        base,
        branch,
        worktree_path,
        task_file_value,
    })
}

fn ensure_new_id(store: &crate::store::QueueStore, task_id: &str) -> Result<()> {
    if store.get(task_id)?.is_some() {
        bail!("Record with id '{task_id}' already exists");
    }
    Ok(())
}

/// Worktree path precedence: CLI override, then header, then derived.
fn resolve_worktree(
    override_arg: Option<&str>,
    header_value: Option<&str>,
    repo: &Path,
    task_id: &str,
) -> Result<PathBuf> {
    if let Some(value) = override_arg.or(header_value) {
        return absolutize(Path::new(value));
    }
    Ok(git::derive_worktree_path(repo, task_id, None)?)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Store root-relative paths for files under the queue root, absolute
/// paths otherwise.
fn display_relative_to_root(paths: &QueuePaths, path: &Path) -> String {
    match path.strip_prefix(paths.root()) {
        Ok(relative) => relative.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskStatus;

    fn scratch() -> (tempfile::TempDir, QueuePaths, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = QueuePaths::new(tmp.path().join("install"));
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        (tmp, paths, repo)
    }

    fn base_opts(repo: &Path) -> AddOptions {
        AddOptions {
            id: Some("T-001".to_string()),
            repo: Some(repo.display().to_string()),
            task: Some("do X".to_string()),
            ..AddOptions::default()
        }
    }

    #[test]
    fn inline_add_creates_record_and_canonical_file() {
        let (_tmp, paths, repo) = scratch();
        let code = add(&paths, &base_opts(&repo)).unwrap();
        assert_eq!(code, 0);

        assert!(paths.task_file("T-001").is_file());
        let content = std::fs::read_to_string(paths.task_file("T-001")).unwrap();
        assert!(content.starts_with("---\nid: T-001\n"));
        assert!(content.ends_with("do X"));

        let store = open_store(&paths).unwrap();
        let record = store.get("T-001").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Todo);
        assert_eq!(record.branch, "task/t-001");
        assert_eq!(record.base, "main");
        assert_eq!(record.task_file, "queue/tasks/T-001.md");
        assert!(record.worktree_path.ends_with("repo/T-001"));
        assert_eq!(record.attempt, 0);
        assert_eq!(record.port, 0);
    }

    #[test]
    fn duplicate_add_fails_and_queue_is_unchanged() {
        let (_tmp, paths, repo) = scratch();
        add(&paths, &base_opts(&repo)).unwrap();

        let store = open_store(&paths).unwrap();
        let before = std::fs::read(store.tasks_file()).unwrap();

        let err = add(&paths, &base_opts(&repo)).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let after = std::fs::read(store.tasks_file()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn inline_add_requires_id_and_repo() {
        let (_tmp, paths, repo) = scratch();

        let mut opts = base_opts(&repo);
        opts.id = None;
        assert!(add(&paths, &opts).unwrap_err().to_string().contains("--id"));

        let mut opts = base_opts(&repo);
        opts.repo = None;
        assert!(add(&paths, &opts).unwrap_err().to_string().contains("--repo"));
    }

    #[test]
    fn add_from_task_file_uses_header_and_filename() {
        let (tmp, paths, repo) = scratch();
        let source = tmp.path().join("fix login bug.md");
        std::fs::write(
            &source,
            format!("---\nrepo: {}\nbase: develop\n---\nFix it.\n", repo.display()),
        )
        .unwrap();

        let opts = AddOptions {
            task_file: Some(source.display().to_string()),
            ..AddOptions::default()
        };
        add(&paths, &opts).unwrap();

        let store = open_store(&paths).unwrap();
        let record = store.get("T-FIX-LOGIN-BUG").unwrap().unwrap();
        assert_eq!(record.base, "develop");
        assert_eq!(record.branch, "task/t-fix-login-bug");
        // Source outside the root is stored absolute
        assert_eq!(record.task_file, source.display().to_string());
    }

    #[test]
    fn add_from_headerless_file_requires_repo_flag() {
        let (tmp, paths, repo) = scratch();
        let source = tmp.path().join("plain.md");
        std::fs::write(&source, "Just a body.\n").unwrap();

        let opts = AddOptions {
            task_file: Some(source.display().to_string()),
            ..AddOptions::default()
        };
        let err = add(&paths, &opts).unwrap_err();
        assert!(err.to_string().contains("missing repo"));

        let opts = AddOptions {
            repo: Some(repo.display().to_string()),
            task_file: Some(source.display().to_string()),
            ..AddOptions::default()
        };
        add(&paths, &opts).unwrap();
        let store = open_store(&paths).unwrap();
        assert!(store.get("T-PLAIN").unwrap().is_some());
    }

    #[test]
    fn worktree_override_wins_over_derivation() {
        let (tmp, paths, repo) = scratch();
        let mut opts = base_opts(&repo);
        opts.worktree_path = Some(tmp.path().join("custom-wt").display().to_string());
        add(&paths, &opts).unwrap();

        let store = open_store(&paths).unwrap();
        let record = store.get("T-001").unwrap().unwrap();
        assert_eq!(
            record.worktree_path,
            tmp.path().join("custom-wt").display().to_string()
        );
    }

    #[test]
    fn missing_source_file_is_an_error() {
        let (_tmp, paths, _repo) = scratch();
        let opts = AddOptions {
            task_file: Some("/no/such/file.md".to_string()),
            ..AddOptions::default()
        };
        let err = add(&paths, &opts).unwrap_err();
        assert!(err.to_string().contains("Source file not found"));
    }
}
