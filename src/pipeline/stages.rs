//! The pipeline stages and the per-attempt sandbox bootstrap.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::naming;
use crate::runtime::docker::ContainerConfig;
use crate::runtime::opencode::{
    self, AgentError, PhaseFailure, SequenceStatus, validate_endpoint,
};
use crate::store::{RecordPatch, TaskRecord, TaskStatus};
use crate::task_file::read_task_body;

use super::report::{generate_error_report, write_error_report};
use super::{Stage, StageError, TaskProcessor};

impl TaskProcessor {
    /// Setup: read the task body, materialize worktree and sandbox,
    /// launch the container, and persist `planning → building`.
    pub(super) fn stage_setup(&self, record: &mut TaskRecord) -> Result<(), StageError> {
        let task_id = record.id.clone();
        let setup = |message: String| StageError::new(Stage::Setup, &task_id, message);

        let task_path = self.paths.resolve(&record.task_file);
        let body = read_task_body(&task_path).map_err(|e| setup(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(setup(format!("task body is empty: {}", task_path.display())));
        }

        if record.worktree_path.is_empty() {
            return Err(setup("record has no worktree_path".to_string()));
        }
        if record.branch.is_empty() {
            record.branch = naming::derive_branch_name(&record.id);
        }

        let repo = PathBuf::from(&record.repo);
        let worktree = PathBuf::from(&record.worktree_path);

        if self.dirty_run && worktree.exists() {
            tracing::info!(task = %record.id, "dirty run: reusing worktree {}", worktree.display());
            match self.runtime.cleanup_task_containers(&record.id) {
                Ok(0) => {}
                Ok(n) => tracing::info!(task = %record.id, "purged {n} stale container(s)"),
                Err(e) => tracing::warn!(task = %record.id, "stale container purge failed: {e}"),
            }
        } else {
            self.runtime
                .create_worktree(&repo, &worktree, &record.branch, &record.base)
                .map_err(|e| setup(e.to_string()))?;
        }

        // Per-attempt strict-local sandbox
        let attempt_dir = self.paths.attempt_dir(&record.id, record.attempt);
        let config_dir = self.paths.attempt_config_dir(&record.id, record.attempt);
        let data_dir = self.paths.attempt_data_dir(&record.id, record.attempt);

        let (host_config, host_data) = self
            .runtime
            .host_agent_dirs()
            .map_err(|e| setup(format!("failed to resolve host agent dirs: {e}")))?;
        bootstrap_config_snapshot(&host_config, &config_dir)
            .map_err(|e| setup(format!("config sandbox bootstrap failed: {e}")))?;
        bootstrap_data_snapshot(&host_data, &data_dir)
            .map_err(|e| setup(format!("data sandbox bootstrap failed: {e}")))?;

        let port = self
            .runtime
            .reserve_port()
            .map_err(|e| setup(e.to_string()))?;

        let mut config = ContainerConfig::new(&record.id, &self.image, &worktree, port)
            .mount(&config_dir, opencode::CONTAINER_CONFIG_DIR, false)
            .mount(&data_dir, opencode::CONTAINER_DATA_DIR, true);
        config.name = naming::derive_container_name(&record.id, &record.created_at);
        config.working_dir = Some(worktree);
        config.cmd = self.container_cmd.clone();

        let container_id = self
            .runtime
            .launch_container(&config)
            .map_err(|e| setup(e.to_string()))?;

        let updated = self
            .store
            .update(
                &record.id,
                &RecordPatch {
                    status: Some(TaskStatus::Building),
                    branch: Some(record.branch.clone()),
                    container: Some(container_id),
                    port: Some(port),
                    session_id: Some(self.session_id.clone()),
                    opencode_attempt_dir: Some(attempt_dir.display().to_string()),
                    opencode_config_dir: Some(config_dir.display().to_string()),
                    opencode_data_dir: Some(data_dir.display().to_string()),
                    ..RecordPatch::default()
                },
            )
            .map_err(|e| setup(format!("failed to persist setup state: {e}")))?;

        *record = updated;
        Ok(())
    }

    /// Execute: run the planning→building sequence against the
    /// container's endpoint with the worktree as working directory.
    pub(super) fn stage_execute(&self, record: &TaskRecord) -> Result<(), StageError> {
        let body = read_task_body(&self.paths.resolve(&record.task_file))
            .map_err(|e| StageError::new(Stage::Planning, &record.id, e.to_string()))?;

        let endpoint = validate_endpoint(&self.container_host, record.port)
            .map_err(|e| StageError::new(Stage::Planning, &record.id, e.to_string()))?;

        let worktree = PathBuf::from(&record.worktree_path);
        let sequence = self.runtime.run_plan_sequence(&endpoint, &body, &worktree);

        match sequence.status {
            SequenceStatus::Success => Ok(()),
            SequenceStatus::PlanFailed => Err(phase_stage_error(
                Stage::Planning,
                &record.id,
                opencode::MAKE_PLAN_COMMAND,
                sequence.error,
            )),
            SequenceStatus::BuildFailed => Err(phase_stage_error(
                Stage::Building,
                &record.id,
                opencode::EXECUTE_PLAN_COMMAND,
                sequence.error,
            )),
        }
    }

    /// Success: park the task for human review, keeping the container,
    /// port, and sandbox paths so the operator can attach the TUI.
    pub(super) fn stage_success(&self, record: &TaskRecord) -> Result<TaskRecord, StageError> {
        self.store
            .update(
                &record.id,
                &RecordPatch {
                    status: Some(TaskStatus::Review),
                    error_file: Some(String::new()),
                    ..RecordPatch::default()
                },
            )
            .map_err(|e| {
                StageError::new(
                    Stage::Success,
                    &record.id,
                    format!("failed to persist review state: {e}"),
                )
            })
    }

    /// Failure: write the diagnostic report, optionally tear down runtime
    /// artifacts, and persist the `failed` transition. Never errors.
    pub(super) fn stage_failure(&self, record: TaskRecord, err: &StageError) -> TaskRecord {
        let report = generate_error_report(
            &record,
            err.stage.as_str(),
            &err.command,
            err.exit_code,
            &err.stdout,
            &err.stderr,
        );
        let error_file = match write_error_report(&report, &record.id, &self.paths.errors_dir()) {
            Ok(path) => path.display().to_string(),
            Err(e) => {
                tracing::warn!(task = %record.id, "failed to write error report: {e}");
                String::new()
            }
        };

        if self.cleanup_on_fail {
            if let Err(e) = self.runtime.cleanup_task_containers(&record.id) {
                tracing::warn!(task = %record.id, "container cleanup failed: {e}");
            }
            if !record.worktree_path.is_empty()
                && let Err(e) = self.runtime.remove_worktree(
                    Path::new(&record.repo),
                    Path::new(&record.worktree_path),
                    true,
                )
            {
                tracing::warn!(task = %record.id, "worktree cleanup failed: {e}");
            }
        }

        match self.store.update(
            &record.id,
            &RecordPatch {
                status: Some(TaskStatus::Failed),
                error_file: Some(error_file.clone()),
                ..RecordPatch::default()
            },
        ) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(task = %record.id, "failed to persist failed state: {e}");
                let mut fallback = record;
                fallback.status = TaskStatus::Failed;
                fallback.error_file = error_file;
                fallback
            }
        }
    }
}

fn phase_stage_error(
    stage: Stage,
    task_id: &str,
    command: &str,
    error: Option<AgentError>,
) -> StageError {
    let mut stage_err = StageError::new(stage, task_id, String::new());
    stage_err.command = command.to_string();

    match error {
        Some(AgentError::Plan(failure) | AgentError::Build(failure)) => {
            let PhaseFailure {
                exit_code,
                stdout,
                stderr,
                endpoint,
            } = failure;
            stage_err.message = format!("{stage} phase failed against {endpoint}");
            stage_err.exit_code = exit_code;
            stage_err.stdout = stdout;
            stage_err.stderr = stderr;
        }
        Some(AgentError::Endpoint(message)) => {
            stage_err.message = message.clone();
            stage_err.stderr = message;
        }
        None => {
            stage_err.message = format!("{stage} phase failed");
        }
    }
    stage_err
}

// ── Sandbox bootstrap ──

/// Resolve the host agent config/data directories, creating them when
/// missing. Config honors `OPENCODE_CONFIG_DIR`, data honors
/// `XDG_DATA_HOME`; both fall back to the conventional home locations.
pub(super) fn resolve_host_agent_dirs() -> io::Result<(PathBuf, PathBuf)> {
    let home = dirs::home_dir()
        .ok_or_else(|| io::Error::other("could not determine home directory"))?;
    let (config, data) = host_agent_dirs_from(
        std::env::var("OPENCODE_CONFIG_DIR").ok().as_deref(),
        std::env::var("XDG_DATA_HOME").ok().as_deref(),
        &home,
    );
    fs::create_dir_all(&config)?;
    fs::create_dir_all(&data)?;
    Ok((config, data))
}

fn host_agent_dirs_from(
    config_override: Option<&str>,
    xdg_data_home: Option<&str>,
    home: &Path,
) -> (PathBuf, PathBuf) {
    let config = match config_override.filter(|s| !s.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => home.join(".config").join("opencode"),
    };
    let data = match xdg_data_home.filter(|s| !s.is_empty()) {
        Some(dir) => Path::new(dir).join("opencode"),
        None => home.join(".local").join("share").join("opencode"),
    };
    (config, data)
}

/// Seed the sandbox config: replace the target with a copy of the host
/// config tree, or leave an empty directory when the host has none.
pub(crate) fn bootstrap_config_snapshot(host_config: &Path, target: &Path) -> io::Result<()> {
    if host_config.is_dir() {
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        copy_dir_recursive(host_config, target)
    } else {
        fs::create_dir_all(target)
    }
}

/// Seed the sandbox data dir: only the host `auth.json` is carried over.
pub(crate) fn bootstrap_data_snapshot(host_data: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    let auth = host_data.join("auth.json");
    if auth.is_file() {
        fs::copy(&auth, target.join("auth.json"))?;
    }
    Ok(())
}

/// Recursively copy a directory tree from `src` to `dst`.
fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::QueuePaths;
    use crate::pipeline::Runtime;
    use crate::runtime::docker::DockerError;
    use crate::runtime::git::GitError;
    use crate::runtime::opencode::{PhaseOutput, PlanSequence};
    use crate::store::QueueStore;
    use crate::task_file;
    use parking_lot::Mutex;
    use std::sync::Arc;

    // ── sandbox bootstrap ──

    #[test]
    fn config_bootstrap_copies_the_host_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host-config");
        fs::create_dir_all(host.join("nested")).unwrap();
        fs::write(host.join("config.json"), "{}").unwrap();
        fs::write(host.join("nested").join("deep.txt"), "content").unwrap();

        let target = tmp.path().join("sandbox").join("config");
        bootstrap_config_snapshot(&host, &target).unwrap();

        assert_eq!(fs::read_to_string(target.join("config.json")).unwrap(), "{}");
        assert_eq!(
            fs::read_to_string(target.join("nested").join("deep.txt")).unwrap(),
            "content"
        );
    }

    #[test]
    fn config_bootstrap_replaces_a_stale_target() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host-config");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("fresh.txt"), "new").unwrap();

        let target = tmp.path().join("config");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.txt"), "old").unwrap();

        bootstrap_config_snapshot(&host, &target).unwrap();
        assert!(!target.join("stale.txt").exists());
        assert!(target.join("fresh.txt").exists());
    }

    #[test]
    fn config_bootstrap_leaves_empty_dir_without_host_source() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("config");
        bootstrap_config_snapshot(&tmp.path().join("missing"), &target).unwrap();

        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn data_bootstrap_copies_only_auth_json() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host-data");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("auth.json"), "{\"token\":\"x\"}").unwrap();
        fs::write(host.join("history.db"), "not copied").unwrap();

        let target = tmp.path().join("data");
        bootstrap_data_snapshot(&host, &target).unwrap();

        assert!(target.join("auth.json").is_file());
        assert!(!target.join("history.db").exists());
    }

    #[test]
    fn data_bootstrap_tolerates_missing_host_auth() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("data");
        bootstrap_data_snapshot(&tmp.path().join("missing"), &target).unwrap();
        assert!(target.is_dir());
        assert!(!target.join("auth.json").exists());
    }

    // ── host dir resolution ──

    #[test]
    fn host_dirs_honor_env_overrides() {
        let home = Path::new("/home/op");
        let (config, data) =
            host_agent_dirs_from(Some("/custom/opencode-config"), Some("/custom/data"), home);
        assert_eq!(config, PathBuf::from("/custom/opencode-config"));
        assert_eq!(data, PathBuf::from("/custom/data/opencode"));
    }

    #[test]
    fn host_dirs_default_to_home_conventions() {
        let home = Path::new("/home/op");
        let (config, data) = host_agent_dirs_from(None, None, home);
        assert_eq!(config, PathBuf::from("/home/op/.config/opencode"));
        assert_eq!(data, PathBuf::from("/home/op/.local/share/opencode"));
    }

    // ── full pipeline against a stub runtime ──

    #[derive(Default)]
    struct StubBehavior {
        fail_port: bool,
        fail_worktree: bool,
        fail_launch: bool,
        plan_failure: Option<PhaseFailure>,
        build_failure: Option<PhaseFailure>,
    }

    struct StubRuntime {
        behavior: StubBehavior,
        host_config: PathBuf,
        host_data: PathBuf,
        launched: Mutex<Option<ContainerConfig>>,
        worktrees_created: Mutex<Vec<PathBuf>>,
        worktrees_removed: Mutex<Vec<PathBuf>>,
        container_purges: Mutex<u32>,
    }

    impl StubRuntime {
        fn new(host_root: &Path, behavior: StubBehavior) -> Self {
            let host_config = host_root.join("host-config");
            let host_data = host_root.join("host-data");
            fs::create_dir_all(&host_config).unwrap();
            fs::create_dir_all(&host_data).unwrap();
            StubRuntime {
                behavior,
                host_config,
                host_data,
                launched: Mutex::new(None),
                worktrees_created: Mutex::new(Vec::new()),
                worktrees_removed: Mutex::new(Vec::new()),
                container_purges: Mutex::new(0),
            }
        }
    }

    impl Runtime for StubRuntime {
        fn create_worktree(
            &self,
            _repo: &Path,
            worktree: &Path,
            _branch: &str,
            _base: &str,
        ) -> Result<PathBuf, GitError> {
            if self.behavior.fail_worktree {
                return Err(GitError::Worktree("disk full".to_string()));
            }
            fs::create_dir_all(worktree).unwrap();
            self.worktrees_created.lock().push(worktree.to_path_buf());
            Ok(worktree.to_path_buf())
        }

        fn remove_worktree(
            &self,
            _repo: &Path,
            worktree: &Path,
            _force: bool,
        ) -> Result<(), GitError> {
            self.worktrees_removed.lock().push(worktree.to_path_buf());
            Ok(())
        }

        fn reserve_port(&self) -> Result<u16, DockerError> {
            if self.behavior.fail_port {
                return Err(DockerError::PortAllocation("no free port".to_string()));
            }
            Ok(30001)
        }

        fn launch_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
            if self.behavior.fail_launch {
                return Err(DockerError::Start {
                    container_id: config.name.clone(),
                    stderr: "image not found".to_string(),
                });
            }
            *self.launched.lock() = Some(config.clone());
            Ok("container-abc123".to_string())
        }

        fn cleanup_task_containers(&self, _task_id: &str) -> Result<usize, DockerError> {
            *self.container_purges.lock() += 1;
            Ok(1)
        }

        fn host_agent_dirs(&self) -> io::Result<(PathBuf, PathBuf)> {
            Ok((self.host_config.clone(), self.host_data.clone()))
        }

        fn run_plan_sequence(
            &self,
            _endpoint: &str,
            _task_body: &str,
            _workdir: &Path,
        ) -> PlanSequence {
            if let Some(ref failure) = self.behavior.plan_failure {
                return PlanSequence {
                    status: SequenceStatus::PlanFailed,
                    plan: None,
                    build: None,
                    error: Some(AgentError::Plan(failure.clone())),
                };
            }
            if let Some(ref failure) = self.behavior.build_failure {
                return PlanSequence {
                    status: SequenceStatus::BuildFailed,
                    plan: Some(PhaseOutput {
                        stdout: "plan output".to_string(),
                        stderr: String::new(),
                    }),
                    build: None,
                    error: Some(AgentError::Build(failure.clone())),
                };
            }
            PlanSequence {
                status: SequenceStatus::Success,
                plan: Some(PhaseOutput {
                    stdout: "plan output".to_string(),
                    stderr: String::new(),
                }),
                build: Some(PhaseOutput {
                    stdout: "build output".to_string(),
                    stderr: String::new(),
                }),
                error: None,
            }
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        paths: QueuePaths,
        store: Arc<QueueStore>,
        runtime: Arc<StubRuntime>,
        record: TaskRecord,
    }

    fn fixture(behavior: StubBehavior) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let paths = QueuePaths::new(tmp.path());
        paths.ensure_dirs().unwrap();

        let repo_dir = tmp.path().join("repo");
        fs::create_dir_all(&repo_dir).unwrap();

        let doc = task_file::canonical_task_document(
            "T-001",
            repo_dir.to_str().unwrap(),
            "Implement feature X\n\nThis is a test task.\n",
            "main",
            None,
            None,
        )
        .unwrap();
        task_file::write_task_file("T-001", &doc, &paths.tasks_dir()).unwrap();

        let mut record = TaskRecord::new_todo(
            "T-001",
            repo_dir.display().to_string(),
            "main",
            "queue/tasks/T-001.md",
            "task/t-001",
            tmp.path().join("worktrees").join("repo").join("T-001").display().to_string(),
        );
        record.status = TaskStatus::Planning;

        let store = Arc::new(QueueStore::open(paths.tasks_file()).unwrap());
        store.add(record.clone()).unwrap();

        let runtime = Arc::new(StubRuntime::new(tmp.path(), behavior));

        Fixture {
            _tmp: tmp,
            paths,
            store,
            runtime,
            record,
        }
    }

    fn processor(fixture: &Fixture) -> TaskProcessor {
        TaskProcessor::new(
            Arc::clone(&fixture.store),
            fixture.paths.clone(),
            "test-session",
        )
        .with_runtime(fixture.runtime.clone())
    }

    #[test]
    fn happy_path_runs_all_stages_and_parks_for_review() {
        let fx = fixture(StubBehavior::default());
        let result = processor(&fx).process(fx.record.clone());

        assert_eq!(result.status, TaskStatus::Review);
        assert_eq!(result.container, "container-abc123");
        assert_eq!(result.port, 30001);
        assert_eq!(result.session_id, "test-session");
        assert_eq!(result.error_file, "");

        // Sandbox dirs were created and recorded
        assert!(Path::new(&result.opencode_config_dir).is_dir());
        assert!(Path::new(&result.opencode_data_dir).is_dir());
        assert!(result.opencode_attempt_dir.ends_with("attempt-1"));

        // Store reflects the final state
        let stored = fx.store.get("T-001").unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Review);
    }

    #[test]
    fn launch_config_uses_strict_local_mounts_and_path_parity() {
        let fx = fixture(StubBehavior::default());
        let result = processor(&fx).process(fx.record.clone());
        assert_eq!(result.status, TaskStatus::Review);

        let launched = fx.runtime.launched.lock();
        let config = launched.as_ref().unwrap();

        assert_eq!(config.image, crate::runtime::docker::DEFAULT_IMAGE);
        assert_eq!(config.cmd, opencode::server_cmd());
        assert!(config.name.starts_with("task-T-001-"));
        assert!(
            config
                .name
                .ends_with(&naming::compact_timestamp(&fx.record.created_at))
        );

        // Worktree mounted at path parity and writable
        let worktree = PathBuf::from(&fx.record.worktree_path);
        assert_eq!(config.mounts.get(&worktree), Some(&worktree));
        assert!(config.writable_mounts.contains(&worktree));
        assert_eq!(config.working_dir.as_ref(), Some(&worktree));

        // Sandbox dirs mounted at the container's agent paths, config ro,
        // data rw
        let container_paths: Vec<_> = config.mounts.values().cloned().collect();
        assert!(container_paths.contains(&PathBuf::from(opencode::CONTAINER_CONFIG_DIR)));
        assert!(container_paths.contains(&PathBuf::from(opencode::CONTAINER_DATA_DIR)));
        assert!(
            !config
                .writable_mounts
                .contains(Path::new(opencode::CONTAINER_CONFIG_DIR))
        );
        assert!(
            config
                .writable_mounts
                .contains(Path::new(opencode::CONTAINER_DATA_DIR))
        );
    }

    #[test]
    fn sandbox_bootstrap_seeds_config_and_auth_from_host() {
        let fx = fixture(StubBehavior::default());
        fs::write(fx.runtime.host_config.join("settings.json"), "{}").unwrap();
        fs::write(fx.runtime.host_data.join("auth.json"), "{\"k\":1}").unwrap();
        fs::write(fx.runtime.host_data.join("sessions.db"), "skip").unwrap();

        let result = processor(&fx).process(fx.record.clone());
        assert_eq!(result.status, TaskStatus::Review);

        let config_dir = Path::new(&result.opencode_config_dir);
        let data_dir = Path::new(&result.opencode_data_dir);
        assert!(config_dir.join("settings.json").is_file());
        assert!(data_dir.join("auth.json").is_file());
        assert!(!data_dir.join("sessions.db").exists());
    }

    #[test]
    fn plan_failure_persists_failed_with_report_and_keeps_artifacts() {
        let fx = fixture(StubBehavior {
            plan_failure: Some(PhaseFailure {
                exit_code: 0,
                stdout: String::new(),
                stderr: "error: cannot plan".to_string(),
                endpoint: "http://127.0.0.1:30001".to_string(),
            }),
            ..StubBehavior::default()
        });

        let result = processor(&fx).process(fx.record.clone());

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(!result.error_file.is_empty());

        let report = fs::read_to_string(&result.error_file).unwrap();
        assert!(report.contains("planning"));
        assert!(report.contains(opencode::MAKE_PLAN_COMMAND));
        assert!(report.contains("error: cannot plan"));

        // Artifacts retained by default so the operator can attach a review
        assert!(fx.runtime.worktrees_removed.lock().is_empty());
        assert!(Path::new(&fx.record.worktree_path).is_dir());
    }

    #[test]
    fn build_failure_is_attributed_to_the_building_stage() {
        let fx = fixture(StubBehavior {
            build_failure: Some(PhaseFailure {
                exit_code: 2,
                stdout: "partial".to_string(),
                stderr: "compile error".to_string(),
                endpoint: "http://127.0.0.1:30001".to_string(),
            }),
            ..StubBehavior::default()
        });

        let result = processor(&fx).process(fx.record.clone());
        assert_eq!(result.status, TaskStatus::Failed);

        let report = fs::read_to_string(&result.error_file).unwrap();
        assert!(report.contains("building"));
        assert!(report.contains(opencode::EXECUTE_PLAN_COMMAND));
        assert!(report.contains("compile error"));
    }

    #[test]
    fn cleanup_on_fail_removes_containers_and_worktree() {
        let fx = fixture(StubBehavior {
            plan_failure: Some(PhaseFailure {
                exit_code: 1,
                stdout: String::new(),
                stderr: "boom".to_string(),
                endpoint: "http://127.0.0.1:30001".to_string(),
            }),
            ..StubBehavior::default()
        });

        let result = processor(&fx).cleanup_on_fail(true).process(fx.record.clone());

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(*fx.runtime.container_purges.lock() >= 1);
        assert_eq!(
            fx.runtime.worktrees_removed.lock().as_slice(),
            &[PathBuf::from(&fx.record.worktree_path)]
        );
    }

    #[test]
    fn setup_failure_on_missing_worktree_path_fails_the_task() {
        let fx = fixture(StubBehavior::default());
        let mut record = fx.record.clone();
        record.worktree_path = String::new();
        fx.store
            .update(
                "T-001",
                &RecordPatch {
                    worktree_path: Some(String::new()),
                    ..RecordPatch::default()
                },
            )
            .unwrap();

        let result = processor(&fx).process(record);
        assert_eq!(result.status, TaskStatus::Failed);
        let report = fs::read_to_string(&result.error_file).unwrap();
        assert!(report.contains("setup"));
    }

    #[test]
    fn setup_failure_on_port_allocation_fails_the_task() {
        let fx = fixture(StubBehavior {
            fail_port: true,
            ..StubBehavior::default()
        });
        let result = processor(&fx).process(fx.record.clone());
        assert_eq!(result.status, TaskStatus::Failed);
    }

    #[test]
    fn setup_failure_on_worktree_creation_fails_the_task() {
        let fx = fixture(StubBehavior {
            fail_worktree: true,
            ..StubBehavior::default()
        });
        let result = processor(&fx).process(fx.record.clone());
        assert_eq!(result.status, TaskStatus::Failed);
        let report = fs::read_to_string(&result.error_file).unwrap();
        assert!(report.contains("disk full"));
    }

    #[test]
    fn container_start_failure_fails_the_task() {
        let fx = fixture(StubBehavior {
            fail_launch: true,
            ..StubBehavior::default()
        });
        let result = processor(&fx).process(fx.record.clone());
        assert_eq!(result.status, TaskStatus::Failed);
        let report = fs::read_to_string(&result.error_file).unwrap();
        assert!(report.contains("image not found"));
    }

    #[test]
    fn dirty_run_reuses_existing_worktree_and_purges_containers() {
        let fx = fixture(StubBehavior::default());
        fs::create_dir_all(&fx.record.worktree_path).unwrap();

        let result = processor(&fx).dirty_run(true).process(fx.record.clone());

        assert_eq!(result.status, TaskStatus::Review);
        // No fresh worktree was created; stale containers were purged
        assert!(fx.runtime.worktrees_created.lock().is_empty());
        assert!(*fx.runtime.container_purges.lock() >= 1);
    }

    #[test]
    fn synthetic_failure_persists_failed_with_report() {
        let fx = fixture(StubBehavior::default());

        let result = processor(&fx)
            .fail_synthetic("T-001", "index out of bounds")
            .unwrap();

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(!result.error_file.is_empty());
        let report = fs::read_to_string(&result.error_file).unwrap();
        assert!(report.contains("index out of bounds"));
        assert!(report.contains("**Exit code**: -1"));

        // The record is persisted as failed, so retry applies to it
        let stored = fx.store.get("T-001").unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[test]
    fn synthetic_failure_for_unknown_task_is_a_no_op() {
        let fx = fixture(StubBehavior::default());
        assert!(processor(&fx).fail_synthetic("T-404", "boom").is_none());
    }

    #[test]
    fn empty_task_body_is_a_setup_failure() {
        let fx = fixture(StubBehavior::default());
        fs::write(fx.paths.task_file("T-001"), "---\nid: T-001\n---\n   \n").unwrap();

        let result = processor(&fx).process(fx.record.clone());
        assert_eq!(result.status, TaskStatus::Failed);
        let report = fs::read_to_string(&result.error_file).unwrap();
        assert!(report.contains("task body is empty"));
    }
}
