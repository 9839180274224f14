//! Queue directory layout and bootstrap.
//!
//! All paths hang off a single queue root that is injected at construction
//! time, so tests can point the whole tree at a temporary directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable overriding the queue root directory.
pub const ROOT_ENV: &str = "TASKQ_ROOT";

/// Resolver for every path under the `queue/` tree.
#[derive(Debug, Clone)]
pub struct QueuePaths {
    root: PathBuf,
}

impl QueuePaths {
    /// Build the layout under an explicit base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        QueuePaths {
            root: base_dir.into(),
        }
    }

    /// Resolve the default base directory: `$TASKQ_ROOT` if set,
    /// otherwise the current working directory.
    pub fn discover() -> Result<Self> {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            return Ok(QueuePaths::new(root));
        }
        let cwd = std::env::current_dir().context("could not determine working directory")?;
        Ok(QueuePaths::new(cwd))
    }

    /// The base directory containing `queue/`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }

    /// The JSONL record file.
    pub fn tasks_file(&self) -> PathBuf {
        self.queue_dir().join("tasks.jsonl")
    }

    /// Canonical task documents: `queue/tasks/<id>.md`.
    pub fn tasks_dir(&self) -> PathBuf {
        self.queue_dir().join("tasks")
    }

    pub fn task_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.md"))
    }

    /// Diagnostic reports: `queue/errors/<id>-<timestamp>.md`.
    pub fn errors_dir(&self) -> PathBuf {
        self.queue_dir().join("errors")
    }

    /// Root of all per-attempt sandboxes for one task.
    pub fn task_sandbox_dir(&self, task_id: &str) -> PathBuf {
        self.queue_dir().join("opencode").join(task_id)
    }

    /// Sandbox for one `(task, attempt)` pair. The directory name is
    /// 1-indexed: attempt 0 (the first run) maps to `attempt-1`.
    pub fn attempt_dir(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.task_sandbox_dir(task_id)
            .join(format!("attempt-{}", attempt + 1))
    }

    pub fn attempt_config_dir(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.attempt_dir(task_id, attempt).join("config")
    }

    pub fn attempt_data_dir(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.attempt_dir(task_id, attempt).join("data")
    }

    /// Resolve a stored task-file path, which may be absolute or
    /// root-relative (the `add` command stores root-relative when it can).
    pub fn resolve(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Create the on-disk skeleton and touch the record file.
    pub fn ensure_dirs(&self) -> Result<()> {
        let queue = self.queue_dir();
        fs::create_dir_all(&queue)
            .with_context(|| format!("failed to create {}", queue.display()))?;
        fs::create_dir_all(self.tasks_dir())?;
        fs::create_dir_all(self.errors_dir())?;
        fs::create_dir_all(self.queue_dir().join("opencode"))?;

        touch(&self.tasks_dir().join(".gitkeep"))?;
        touch(&self.errors_dir().join(".gitkeep"))?;
        touch(&self.tasks_file())?;
        Ok(())
    }
}

fn touch(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::write(path, b"").with_context(|| format!("failed to create {}", path.display()))?;
    }
    Ok(())
}
