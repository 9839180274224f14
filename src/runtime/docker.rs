//! Container runtime adapter: port reservation, launch configuration,
//! lifecycle inspection, bulk cleanup by task, and image builds.
//!
//! Everything shells out to the `docker` CLI with bounded timeouts;
//! failures come back as typed [`DockerError`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

use crate::naming;

use super::exec::{ExecError, ExecOutput, run_with_timeout};

/// Runtime image used for task containers.
pub const DEFAULT_IMAGE: &str = "taskq/opencode:latest";

/// Fixed port the agent server listens on inside the container.
pub const CONTAINER_AGENT_PORT: u16 = 8000;

/// First host port probed when reserving a port for a task.
pub const DEFAULT_PORT_SCAN_START: u16 = 30000;
const PORT_SCAN_SPAN: u16 = 1000;

const RUN_TIMEOUT: Duration = Duration::from_secs(60);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);
const RM_TIMEOUT: Duration = Duration::from_secs(30);
const PS_TIMEOUT: Duration = Duration::from_secs(30);
const LOGS_TIMEOUT: Duration = Duration::from_secs(30);
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Pause between `docker run` returning and the launch readiness check.
const LAUNCH_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container '{container_id}' failed to start: {stderr}")]
    Start { container_id: String, stderr: String },

    #[error("image build failed: {0}")]
    ImageBuild(String),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl From<ExecError> for DockerError {
    fn from(e: ExecError) -> Self {
        DockerError::Runtime(e.to_string())
    }
}

fn docker(args: &[&str], timeout: Duration) -> Result<ExecOutput, ExecError> {
    let mut cmd = Command::new("docker");
    cmd.args(args);
    run_with_timeout(cmd, timeout)
}

// ── Port reservation ──

/// Whether a loopback TCP listener can currently be bound on the port.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Scan ascending for the first bindable loopback port. The reservation
/// is racy by construction (the listener is released immediately);
/// callers accept this and retry on container-start failure.
pub fn find_available_port(start_port: u16, max_port: u16) -> Result<u16, DockerError> {
    for port in start_port..=max_port {
        if is_port_available(port) {
            return Ok(port);
        }
    }
    Err(DockerError::PortAllocation(format!(
        "no free port in {start_port}..={max_port}"
    )))
}

/// Reserve a host port for a task: the preferred port when given and
/// free, otherwise the first free port in the default scan range.
pub fn reserve_port(preferred: Option<u16>) -> Result<u16, DockerError> {
    if let Some(port) = preferred
        && is_port_available(port)
    {
        return Ok(port);
    }
    find_available_port(
        DEFAULT_PORT_SCAN_START,
        DEFAULT_PORT_SCAN_START + PORT_SCAN_SPAN - 1,
    )
}

// ── Launch configuration ──

/// Launch parameters for one task container.
///
/// The worktree is always mounted writable at the same absolute path as
/// on the host, so git metadata and tool output inside the container are
/// interchangeable with the host's.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub task_id: String,
    pub image: String,
    pub worktree_path: PathBuf,
    /// Host port mapped (loopback-only) to [`CONTAINER_AGENT_PORT`].
    pub port: u16,
    pub name: String,
    /// Host path → container path.
    pub mounts: BTreeMap<PathBuf, PathBuf>,
    /// Container-side paths mounted read-write; everything else is `:ro`.
    pub writable_mounts: BTreeSet<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub entrypoint: Option<String>,
    pub cmd: Vec<String>,
    /// Inspect the container shortly after launch and fail if it is not
    /// running.
    pub check_ready: bool,
}

impl ContainerConfig {
    pub fn new(
        task_id: impl Into<String>,
        image: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        port: u16,
    ) -> Self {
        let task_id = task_id.into();
        let worktree_path = worktree_path.into();

        let mut mounts = BTreeMap::new();
        mounts.insert(worktree_path.clone(), worktree_path.clone());
        let mut writable_mounts = BTreeSet::new();
        writable_mounts.insert(worktree_path.clone());

        ContainerConfig {
            name: format!("task-{task_id}"),
            task_id,
            image: image.into(),
            worktree_path,
            port,
            mounts,
            writable_mounts,
            env: BTreeMap::new(),
            working_dir: None,
            entrypoint: None,
            cmd: Vec::new(),
            check_ready: true,
        }
    }

    /// Add a mount. Read-only unless `writable`.
    pub fn mount(
        mut self,
        host: impl Into<PathBuf>,
        container: impl Into<PathBuf>,
        writable: bool,
    ) -> Self {
        let container = container.into();
        if writable {
            self.writable_mounts.insert(container.clone());
        }
        self.mounts.insert(host.into(), container);
        self
    }

    /// Build the `docker run` argument vector for this configuration.
    fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "-p".to_string(),
            format!("127.0.0.1:{}:{}", self.port, CONTAINER_AGENT_PORT),
        ];

        for (host, container) in &self.mounts {
            let volume = if self.writable_mounts.contains(container) {
                format!("{}:{}", host.display(), container.display())
            } else {
                format!("{}:{}:ro", host.display(), container.display())
            };
            args.push("-v".to_string());
            args.push(volume);
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        if let Some(ref workdir) = self.working_dir {
            args.push("-w".to_string());
            args.push(workdir.display().to_string());
        }
        if let Some(ref entrypoint) = self.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.push(self.image.clone());
        args.extend(self.cmd.iter().cloned());
        args
    }
}

// ── Lifecycle ──

/// Snapshot of a container's state as reported by `docker inspect`.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub container_id: String,
    pub name: String,
    pub state: String,
    pub exit_code: i32,
    pub pid: i32,
    pub running: bool,
}

#[derive(Deserialize)]
struct InspectPayload {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: i32,
    #[serde(rename = "Pid", default)]
    pid: i32,
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no such object") || lowered.contains("no such container")
}

/// Inspect a container by id or name.
pub fn inspect_container(container_id: &str) -> Result<ContainerStatus, DockerError> {
    let output = docker(
        &["inspect", "--format", "{{json .}}", container_id],
        INSPECT_TIMEOUT,
    )?;

    if !output.success() {
        if is_not_found(&output.stderr) {
            return Err(DockerError::NotFound(container_id.to_string()));
        }
        return Err(DockerError::Runtime(format!(
            "docker inspect failed: {}",
            output.stderr.trim()
        )));
    }

    let payload: InspectPayload = serde_json::from_str(output.stdout.trim())
        .map_err(|e| DockerError::Runtime(format!("unparseable inspect output: {e}")))?;

    Ok(ContainerStatus {
        container_id: payload.id,
        name: payload.name.trim_start_matches('/').to_string(),
        state: payload.state.status,
        exit_code: payload.state.exit_code,
        pid: payload.state.pid,
        running: payload.state.running,
    })
}

/// Launch a container and return its short id. With `check_ready` set,
/// the container is inspected shortly after launch and a non-running
/// state fails with [`DockerError::Start`].
pub fn launch_container(config: &ContainerConfig) -> Result<String, DockerError> {
    let args = config.run_args();
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = docker(&arg_refs, RUN_TIMEOUT)?;

    if !output.success() {
        return Err(DockerError::Start {
            container_id: config.name.clone(),
            stderr: output.stderr.trim().to_string(),
        });
    }

    let full_id = output.stdout.trim().to_string();
    let container_id = full_id.chars().take(12).collect::<String>();

    if config.check_ready {
        std::thread::sleep(LAUNCH_SETTLE);
        let status = inspect_container(&container_id).map_err(|e| DockerError::Start {
            container_id: container_id.clone(),
            stderr: e.to_string(),
        })?;
        if !status.running {
            return Err(DockerError::Start {
                container_id,
                stderr: format!("container not running after launch (state: {})", status.state),
            });
        }
    }

    Ok(container_id)
}

/// Stop a container. Returns whether anything was actually stopped;
/// stopping an absent or already-stopped container is not an error.
pub fn stop_container(container_id: &str, grace_seconds: u32) -> Result<bool, DockerError> {
    match inspect_container(container_id) {
        Ok(status) if status.running => {}
        Ok(_) => return Ok(false),
        Err(DockerError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    }

    let grace = grace_seconds.to_string();
    let timeout = Duration::from_secs(u64::from(grace_seconds) + 10);
    let output = docker(&["stop", "-t", grace.as_str(), container_id], timeout)?;
    if !output.success() && !is_not_found(&output.stderr) {
        return Err(DockerError::Runtime(format!(
            "docker stop failed: {}",
            output.stderr.trim()
        )));
    }
    Ok(true)
}

/// Remove a container. Returns whether anything was removed.
pub fn remove_container(container_id: &str, force: bool) -> Result<bool, DockerError> {
    let mut args = vec!["rm"];
    if force {
        args.push("-f");
    }
    args.push(container_id);

    let output = docker(&args, RM_TIMEOUT)?;
    if output.success() {
        return Ok(true);
    }
    if is_not_found(&output.stderr) {
        return Ok(false);
    }
    Err(DockerError::Runtime(format!(
        "docker rm failed: {}",
        output.stderr.trim()
    )))
}

/// Fetch a container's combined output.
pub fn container_logs(container_id: &str, tail: Option<u32>) -> Result<(String, String), DockerError> {
    let tail_value;
    let mut args = vec!["logs"];
    if let Some(n) = tail {
        tail_value = n.to_string();
        args.push("--tail");
        args.push(&tail_value);
    }
    args.push(container_id);

    let output = docker(&args, LOGS_TIMEOUT)?;
    if !output.success() {
        if is_not_found(&output.stderr) {
            return Err(DockerError::NotFound(container_id.to_string()));
        }
        return Err(DockerError::Runtime(format!(
            "docker logs failed: {}",
            output.stderr.trim()
        )));
    }
    Ok((output.stdout, output.stderr))
}

/// Poll until the container reports running, or the budget is exhausted.
pub fn wait_ready(container_id: &str, budget: Duration, interval: Duration) -> Result<(), DockerError> {
    let start = Instant::now();
    loop {
        match inspect_container(container_id) {
            Ok(status) if status.running => return Ok(()),
            Ok(_) | Err(DockerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if start.elapsed() >= budget {
            return Err(DockerError::Runtime(format!(
                "container {container_id} not ready within {budget:?}"
            )));
        }
        std::thread::sleep(interval);
    }
}

/// Force-remove every container belonging to a task, matching on the full
/// anchored name prefix (`task-<safe-id>-`) so one task id being a prefix
/// of another cannot purge the wrong containers. Returns the count.
pub fn cleanup_task_containers(task_id: &str) -> Result<usize, DockerError> {
    let output = docker(
        &["ps", "-a", "--format", "{{.ID}}\t{{.Names}}"],
        PS_TIMEOUT,
    )?;
    if !output.success() {
        return Err(DockerError::Runtime(format!(
            "docker ps failed: {}",
            output.stderr.trim()
        )));
    }

    let prefix = naming::container_name_prefix(task_id);
    let mut removed = 0;
    for line in output.stdout.lines() {
        let Some((id, name)) = line.split_once('\t') else {
            continue;
        };
        if name.starts_with(&prefix) && remove_container(id, true)? {
            removed += 1;
        }
    }
    Ok(removed)
}

// ── Image builds ──

/// Build and tag the runtime image. `rebuild` disables the layer cache;
/// `pull` refreshes base layers.
pub fn build_runtime_image(
    image: &str,
    dockerfile: &Path,
    context: &Path,
    rebuild: bool,
    pull: bool,
) -> Result<String, DockerError> {
    let dockerfile_str = dockerfile.to_string_lossy();
    let context_str = context.to_string_lossy();

    let mut args = vec!["build", "-t", image, "-f", dockerfile_str.as_ref()];
    if pull {
        args.push("--pull");
    }
    if rebuild {
        args.push("--no-cache");
    }
    args.push(context_str.as_ref());

    let output = docker(&args, BUILD_TIMEOUT)?;
    if !output.success() {
        return Err(DockerError::ImageBuild(output.stderr.trim().to_string()));
    }
    Ok(output.stdout)
}
