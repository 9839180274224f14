//! Task execution pipeline: setup → execute → success, with a failure
//! stage that reports and persists instead of propagating.
//!
//! The processor drives the adapters through the [`Runtime`] trait so
//! tests can substitute stubs for git, docker, and the agent.

pub mod report;
mod stages;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::paths::QueuePaths;
use crate::runtime::docker::{self, ContainerConfig, DockerError};
use crate::runtime::git::{self, GitError};
use crate::runtime::opencode::{self, PhaseOptions, PlanSequence};
use crate::store::{QueueStore, TaskRecord, TaskStatus};

/// Stage a pipeline failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Planning,
    Building,
    Success,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Planning => "planning",
            Stage::Building => "building",
            Stage::Success => "success",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure inside one pipeline stage, carrying whatever the external
/// command reported.
#[derive(Debug, Error)]
#[error("[{stage}] {message}")]
pub struct StageError {
    pub stage: Stage,
    pub task_id: String,
    pub message: String,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl StageError {
    fn new(stage: Stage, task_id: &str, message: impl Into<String>) -> Self {
        StageError {
            stage,
            task_id: task_id.to_string(),
            message: message.into(),
            command: String::new(),
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// External collaborators the pipeline drives. The production impl is
/// [`SystemRuntime`]; tests inject stubs.
pub trait Runtime: Send + Sync {
    fn create_worktree(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<PathBuf, GitError>;

    fn remove_worktree(&self, repo: &Path, worktree: &Path, force: bool) -> Result<(), GitError>;

    fn reserve_port(&self) -> Result<u16, DockerError>;

    fn launch_container(&self, config: &ContainerConfig) -> Result<String, DockerError>;

    fn cleanup_task_containers(&self, task_id: &str) -> Result<usize, DockerError>;

    /// Host-side agent config/data directories used to seed the
    /// per-attempt sandbox. Both are created when missing.
    fn host_agent_dirs(&self) -> std::io::Result<(PathBuf, PathBuf)>;

    fn run_plan_sequence(&self, endpoint: &str, task_body: &str, workdir: &Path) -> PlanSequence;
}

/// Runtime backed by the real adapters.
pub struct SystemRuntime;

impl Runtime for SystemRuntime {
    fn create_worktree(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<PathBuf, GitError> {
        git::create_worktree(repo, worktree, branch, base)
    }

    fn remove_worktree(&self, repo: &Path, worktree: &Path, force: bool) -> Result<(), GitError> {
        git::remove_worktree(repo, worktree, force)
    }

    fn reserve_port(&self) -> Result<u16, DockerError> {
        docker::reserve_port(None)
    }

    fn launch_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
        docker::launch_container(config)
    }

    fn cleanup_task_containers(&self, task_id: &str) -> Result<usize, DockerError> {
        docker::cleanup_task_containers(task_id)
    }

    fn host_agent_dirs(&self) -> std::io::Result<(PathBuf, PathBuf)> {
        stages::resolve_host_agent_dirs()
    }

    fn run_plan_sequence(&self, endpoint: &str, task_body: &str, workdir: &Path) -> PlanSequence {
        opencode::run_plan_sequence(
            endpoint,
            task_body,
            Some(workdir),
            &PhaseOptions::plan(),
            &PhaseOptions::build(),
        )
    }
}

/// Processes claimed records through the full pipeline.
pub struct TaskProcessor {
    store: Arc<QueueStore>,
    paths: QueuePaths,
    session_id: String,
    image: String,
    container_cmd: Vec<String>,
    container_host: String,
    cleanup_on_fail: bool,
    dirty_run: bool,
    runtime: Arc<dyn Runtime>,
}

impl TaskProcessor {
    pub fn new(store: Arc<QueueStore>, paths: QueuePaths, session_id: impl Into<String>) -> Self {
        TaskProcessor {
            store,
            paths,
            session_id: session_id.into(),
            image: docker::DEFAULT_IMAGE.to_string(),
            container_cmd: opencode::server_cmd(),
            container_host: "127.0.0.1".to_string(),
            cleanup_on_fail: false,
            dirty_run: false,
            runtime: Arc::new(SystemRuntime),
        }
    }

    pub fn cleanup_on_fail(mut self, enabled: bool) -> Self {
        self.cleanup_on_fail = enabled;
        self
    }

    pub fn dirty_run(mut self, enabled: bool) -> Self {
        self.dirty_run = enabled;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Run a claimed record (status `planning`) through the pipeline.
    /// Never propagates stage failures: the record comes back in `review`
    /// on success or `failed` with a diagnostic report otherwise.
    pub fn process(&self, record: TaskRecord) -> TaskRecord {
        tracing::info!(task = %record.id, "starting task processing");

        let mut current = record;
        let result = self
            .stage_setup(&mut current)
            .and_then(|()| self.stage_execute(&current))
            .and_then(|()| self.stage_success(&current));

        match result {
            Ok(updated) => {
                tracing::info!(task = %updated.id, "task completed, parked for review");
                updated
            }
            Err(err) => {
                tracing::error!(task = %current.id, stage = %err.stage, "task failed: {}", err.message);
                self.stage_failure(current, &err)
            }
        }
    }

    /// Persist a synthetic failure for a task whose worker died outside
    /// the normal stage flow (a pipeline bug, not a task failure). The
    /// record gets a diagnostic report with exit code -1 and the panic
    /// message as stderr, and transitions to `failed` so it remains
    /// operator-actionable. Best-effort, like the failure stage itself.
    pub fn fail_synthetic(&self, task_id: &str, message: &str) -> Option<TaskRecord> {
        let record = match self.store.get(task_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(task = %task_id, "cannot persist synthetic failure: record missing");
                return None;
            }
            Err(e) => {
                tracing::warn!(task = %task_id, "cannot persist synthetic failure: {e}");
                return None;
            }
        };

        let stage = match record.status {
            TaskStatus::Building => Stage::Building,
            _ => Stage::Planning,
        };
        let mut err = StageError::new(stage, task_id, format!("worker panicked: {message}"));
        err.stderr = message.to_string();

        Some(self.stage_failure(record, &err))
    }
}
