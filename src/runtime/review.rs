//! Interactive review launcher.
//!
//! Attaches the operator's review TUI to a task's running agent endpoint
//! with a strict-local environment: only the per-attempt sandbox
//! directories are exposed, never the operator's own agent state.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use wait_timeout::ChildExt;

use crate::store::TaskRecord;

use super::env::build_review_env;

/// Review TUI binary.
const REVIEW_BIN: &str = "openchamber";

/// Upper bound for one interactive review session.
const REVIEW_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review launch failed for task '{task_id}' (exit {exit_code}): {stderr}")]
    Launch {
        task_id: String,
        exit_code: i32,
        endpoint: String,
        stderr: String,
    },

    #[error("strict-local validation failed for task '{task_id}': {message}")]
    StrictLocal { task_id: String, message: String },
}

/// Validated launch parameters extracted from a task record.
#[derive(Debug, Clone)]
pub struct ReviewLaunch {
    pub task_id: String,
    pub port: u16,
    pub worktree_path: Option<PathBuf>,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

/// Check a record's runtime handles and strict-local sandbox directories.
pub fn validate_record(record: &TaskRecord) -> Result<ReviewLaunch, ReviewError> {
    if record.id.trim().is_empty() {
        return Err(ReviewError::Launch {
            task_id: String::new(),
            exit_code: -1,
            endpoint: String::new(),
            stderr: "record has no task id".to_string(),
        });
    }
    if record.port == 0 {
        return Err(ReviewError::Launch {
            task_id: record.id.clone(),
            exit_code: -1,
            endpoint: String::new(),
            stderr: format!("invalid port allocated: {}", record.port),
        });
    }

    if record.opencode_config_dir.is_empty() {
        return Err(ReviewError::StrictLocal {
            task_id: record.id.clone(),
            message: "record is missing opencode_config_dir".to_string(),
        });
    }
    if record.opencode_data_dir.is_empty() {
        return Err(ReviewError::StrictLocal {
            task_id: record.id.clone(),
            message: "record is missing opencode_data_dir".to_string(),
        });
    }

    let config_dir = PathBuf::from(&record.opencode_config_dir);
    if !config_dir.is_dir() {
        return Err(ReviewError::StrictLocal {
            task_id: record.id.clone(),
            message: format!(
                "opencode_config_dir does not exist: {}",
                config_dir.display()
            ),
        });
    }
    let data_dir = PathBuf::from(&record.opencode_data_dir);
    if !data_dir.is_dir() {
        return Err(ReviewError::StrictLocal {
            task_id: record.id.clone(),
            message: format!("opencode_data_dir does not exist: {}", data_dir.display()),
        });
    }

    let worktree_path = if record.worktree_path.is_empty() {
        None
    } else {
        Some(PathBuf::from(&record.worktree_path))
    };

    Ok(ReviewLaunch {
        task_id: record.id.clone(),
        port: record.port,
        worktree_path,
        config_dir,
        data_dir,
    })
}

/// Launch the review TUI against a loopback endpoint. Blocks until the
/// operator exits (or the session cap is hit) and returns the child's
/// exit code.
pub fn launch_review(launch: &ReviewLaunch, host: &str) -> Result<i32, ReviewError> {
    let endpoint = format!("http://{host}:{}", launch.port);
    let env = build_review_env(
        &endpoint,
        true,
        launch.config_dir.to_str(),
        launch.data_dir.to_str(),
    );

    let mut cmd = Command::new(REVIEW_BIN);
    cmd.env_clear()
        .envs(&env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(ref worktree) = launch.worktree_path
        && worktree.is_dir()
    {
        cmd.current_dir(worktree);
    }

    let mut child = cmd.spawn().map_err(|e| {
        let stderr = if e.kind() == std::io::ErrorKind::NotFound {
            format!("{REVIEW_BIN} not found on PATH")
        } else {
            format!("failed to launch {REVIEW_BIN}: {e}")
        };
        ReviewError::Launch {
            task_id: launch.task_id.clone(),
            exit_code: -1,
            endpoint: endpoint.clone(),
            stderr,
        }
    })?;

    let status = child
        .wait_timeout(REVIEW_TIMEOUT)
        .map_err(|e| ReviewError::Launch {
            task_id: launch.task_id.clone(),
            exit_code: -1,
            endpoint: endpoint.clone(),
            stderr: e.to_string(),
        })?;

    match status {
        Some(status) => Ok(status.code().unwrap_or(-1)),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(ReviewError::Launch {
                task_id: launch.task_id.clone(),
                exit_code: -1,
                endpoint,
                stderr: format!("review session timeout after {REVIEW_TIMEOUT:?}"),
            })
        }
    }
}

/// Validate a record and launch the review TUI against its endpoint.
pub fn launch_review_from_record(record: &TaskRecord) -> Result<i32, ReviewError> {
    let launch = validate_record(record)?;
    launch_review(&launch, "127.0.0.1")
}
