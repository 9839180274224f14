//! Coding-agent adapter: runs the scripted planning and building phases
//! inside a task's container.
//!
//! The agent CLI is invoked through `docker exec` rather than over the
//! network so it shares the container's config and auth context. The
//! endpoint string is used only as a key to find the container: the
//! adapter resolves it via the published host port.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;

use super::exec::{ExecError, run_with_timeout};

/// Agent CLI binary inside the container.
const AGENT_BIN: &str = "opencode";

/// Agent state directories inside the container.
pub const CONTAINER_CONFIG_DIR: &str = "/root/.config/opencode";
pub const CONTAINER_DATA_DIR: &str = "/root/.local/share/opencode";

/// Command starting the headless agent server in a task container.
pub fn server_cmd() -> Vec<String> {
    ["serve", "--hostname", "0.0.0.0", "--port", "8000"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

pub const DEFAULT_PLAN_MODEL: &str = "openai/gpt-5.3-codex";
pub const DEFAULT_BUILD_MODEL: &str = "openai/gpt-5.3-codex";
pub const DEFAULT_VARIANT: &str = "xhigh";
pub const DEFAULT_PLAN_AGENT: &str = "plan";
pub const DEFAULT_BUILD_AGENT: &str = "build";

pub const DEFAULT_PLAN_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

pub const MAKE_PLAN_COMMAND: &str = "make-plan-sisifo";
pub const EXECUTE_PLAN_COMMAND: &str = "execute-plan-sisifo";

const PS_TIMEOUT: Duration = Duration::from_secs(30);

/// Markers in (ANSI-stripped, lowercased) stderr that turn a zero-exit
/// phase into a failure.
const STDERR_FAILURE_MARKERS: &[&str] = &[
    "error:",
    "failed to change directory",
    "unknown command",
    "not found",
    "unrecognized",
];

/// Captured output of a successful phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Captured context of a failed phase.
#[derive(Debug, Clone)]
pub struct PhaseFailure {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub endpoint: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("planning phase failed (exit {})", .0.exit_code)]
    Plan(PhaseFailure),

    #[error("building phase failed (exit {})", .0.exit_code)]
    Build(PhaseFailure),
}

/// Per-phase invocation parameters. Compile-time defaults, overridable
/// per call.
#[derive(Debug, Clone)]
pub struct PhaseOptions {
    pub model: String,
    pub variant: String,
    pub agent: String,
    pub timeout: Duration,
}

impl PhaseOptions {
    pub fn plan() -> Self {
        PhaseOptions {
            model: DEFAULT_PLAN_MODEL.to_string(),
            variant: DEFAULT_VARIANT.to_string(),
            agent: DEFAULT_PLAN_AGENT.to_string(),
            timeout: DEFAULT_PLAN_TIMEOUT,
        }
    }

    pub fn build() -> Self {
        PhaseOptions {
            model: DEFAULT_BUILD_MODEL.to_string(),
            variant: DEFAULT_VARIANT.to_string(),
            agent: DEFAULT_BUILD_AGENT.to_string(),
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

/// Validate host/port and assemble the endpoint string.
pub fn validate_endpoint(host: &str, port: u16) -> Result<String, AgentError> {
    if host.trim().is_empty() {
        return Err(AgentError::Endpoint("host cannot be empty".to_string()));
    }
    if port == 0 {
        return Err(AgentError::Endpoint("port must be non-zero".to_string()));
    }
    if host.contains("://") {
        Ok(format!("{host}:{port}"))
    } else {
        Ok(format!("http://{host}:{port}"))
    }
}

/// Resolve the endpoint to the single container publishing its port.
fn resolve_container(endpoint: &str) -> Result<String, AgentError> {
    let port = endpoint
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| AgentError::Endpoint(format!("no port in endpoint: {endpoint}")))?;

    let filter = format!("publish={port}");
    let mut cmd = Command::new("docker");
    cmd.args(["ps", "--filter", filter.as_str(), "--format", "{{.ID}}"]);
    let output = run_with_timeout(cmd, PS_TIMEOUT)
        .map_err(|e| AgentError::Endpoint(format!("container lookup failed: {e}")))?;
    if !output.success() {
        return Err(AgentError::Endpoint(format!(
            "container lookup failed: {}",
            output.stderr.trim()
        )));
    }

    let ids: Vec<&str> = output.stdout.lines().filter(|l| !l.is_empty()).collect();
    match ids.as_slice() {
        [id] => Ok((*id).to_string()),
        [] => Err(AgentError::Endpoint(format!(
            "no container publishes port {port}"
        ))),
        _ => Err(AgentError::Endpoint(format!(
            "multiple containers publish port {port}"
        ))),
    }
}

/// Whether captured stderr indicates failure despite a zero exit code.
fn stderr_signals_failure(stderr: &str) -> bool {
    let cleaned = strip_ansi_escapes::strip_str(stderr).to_lowercase();
    STDERR_FAILURE_MARKERS
        .iter()
        .any(|marker| cleaned.contains(marker))
}

/// `docker exec` argument vector for one agent phase.
fn phase_args(
    container_id: &str,
    workdir: Option<&Path>,
    opts: &PhaseOptions,
    command: &str,
    task_body: Option<&str>,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(workdir) = workdir {
        args.push("-w".to_string());
        args.push(workdir.display().to_string());
    }
    args.push(container_id.to_string());
    args.extend(
        [
            AGENT_BIN,
            "run",
            "--model",
            opts.model.as_str(),
            "--variant",
            opts.variant.as_str(),
            "--agent",
            opts.agent.as_str(),
            "--command",
            command,
        ]
        .iter()
        .map(ToString::to_string),
    );
    if let Some(body) = task_body {
        args.push(body.to_string());
    }
    args
}

fn run_phase(
    endpoint: &str,
    workdir: Option<&Path>,
    opts: &PhaseOptions,
    command: &str,
    task_body: Option<&str>,
) -> Result<PhaseOutput, PhaseFailure> {
    let container_id = match resolve_container(endpoint) {
        Ok(id) => id,
        Err(e) => {
            return Err(PhaseFailure {
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                endpoint: endpoint.to_string(),
            });
        }
    };

    let args = phase_args(&container_id, workdir, opts, command, task_body);
    let mut cmd = Command::new("docker");
    cmd.args(&args);

    let output = match run_with_timeout(cmd, opts.timeout) {
        Ok(output) => output,
        Err(ExecError::TimedOut(d)) => {
            return Err(PhaseFailure {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timeout after {d:?}"),
                endpoint: endpoint.to_string(),
            });
        }
        Err(ExecError::Io(e)) => {
            return Err(PhaseFailure {
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                endpoint: endpoint.to_string(),
            });
        }
    };

    if !output.success() || stderr_signals_failure(&output.stderr) {
        return Err(PhaseFailure {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            endpoint: endpoint.to_string(),
        });
    }

    Ok(PhaseOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Run the planning phase: the task body is handed to the agent's
/// `make-plan-sisifo` command.
pub fn run_make_plan(
    endpoint: &str,
    task_body: &str,
    workdir: Option<&Path>,
    opts: &PhaseOptions,
) -> Result<PhaseOutput, AgentError> {
    if endpoint.trim().is_empty() {
        return Err(AgentError::Endpoint("endpoint cannot be empty".to_string()));
    }
    if task_body.trim().is_empty() {
        return Err(AgentError::Endpoint("task body is empty".to_string()));
    }
    run_phase(endpoint, workdir, opts, MAKE_PLAN_COMMAND, Some(task_body))
        .map_err(AgentError::Plan)
}

/// Run the building phase: `execute-plan-sisifo` picks up the state the
/// planning phase left inside the container.
pub fn run_execute_plan(
    endpoint: &str,
    workdir: Option<&Path>,
    opts: &PhaseOptions,
) -> Result<PhaseOutput, AgentError> {
    if endpoint.trim().is_empty() {
        return Err(AgentError::Endpoint("endpoint cannot be empty".to_string()));
    }
    run_phase(endpoint, workdir, opts, EXECUTE_PLAN_COMMAND, None).map_err(AgentError::Build)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Success,
    PlanFailed,
    BuildFailed,
}

/// Combined result of the planning→building sequence.
#[derive(Debug)]
pub struct PlanSequence {
    pub status: SequenceStatus,
    pub plan: Option<PhaseOutput>,
    pub build: Option<PhaseOutput>,
    pub error: Option<AgentError>,
}

/// Run planning, then building if planning succeeded. Never returns an
/// error: failures are captured in the result.
pub fn run_plan_sequence(
    endpoint: &str,
    task_body: &str,
    workdir: Option<&Path>,
    plan_opts: &PhaseOptions,
    build_opts: &PhaseOptions,
) -> PlanSequence {
    let plan = match run_make_plan(endpoint, task_body, workdir, plan_opts) {
        Ok(output) => output,
        Err(e) => {
            return PlanSequence {
                status: SequenceStatus::PlanFailed,
                plan: None,
                build: None,
                error: Some(e),
            };
        }
    };

    match run_execute_plan(endpoint, workdir, build_opts) {
        Ok(build) => PlanSequence {
            status: SequenceStatus::Success,
            plan: Some(plan),
            build: Some(build),
            error: None,
        },
        Err(e) => PlanSequence {
            status: SequenceStatus::BuildFailed,
            plan: Some(plan),
            build: None,
            error: Some(e),
        },
    }
}
