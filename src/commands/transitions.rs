//! `taskq remove/cancel/retry/approve`: operator-driven record
//! transitions.

use anyhow::{Result, bail};

use crate::naming;
use crate::paths::QueuePaths;
use crate::store::{QueueStore, RecordPatch, TaskRecord, TaskStatus};

use super::open_store;

/// Remove a record outright. Active tasks (planning/building) are
/// protected: the pipeline owns them until they settle.
pub fn remove(paths: &QueuePaths, task_id: &str) -> Result<i32> {
    let store = open_store(paths)?;
    let record = require(&store, task_id)?;

    if matches!(record.status, TaskStatus::Planning | TaskStatus::Building) {
        bail!("Cannot remove task in '{}' status", record.status);
    }

    store.remove(task_id)?;
    println!("Task removed: {task_id}");
    Ok(0)
}

pub fn cancel(paths: &QueuePaths, task_id: &str) -> Result<i32> {
    let store = open_store(paths)?;
    require(&store, task_id)?;

    store.update(task_id, &RecordPatch::status(TaskStatus::Cancelled))?;
    println!("Task cancelled: {task_id}");
    Ok(0)
}

/// Retry a failed task: back to `todo` with a bumped attempt counter and
/// cleared runtime handles. Branch and worktree survive so the next run
/// can dirty-reuse them.
pub fn retry(paths: &QueuePaths, task_id: &str) -> Result<i32> {
    let store = open_store(paths)?;
    let record = require(&store, task_id)?;

    if record.status != TaskStatus::Failed {
        bail!(
            "Can only retry tasks in 'failed' status, current status: {}",
            record.status
        );
    }

    let branch = if record.branch.is_empty() {
        naming::derive_branch_name(task_id)
    } else {
        record.branch.clone()
    };

    store.update(
        task_id,
        &RecordPatch {
            status: Some(TaskStatus::Todo),
            branch: Some(branch),
            worktree_path: Some(record.worktree_path.clone()),
            container: Some(String::new()),
            port: Some(0),
            session_id: Some(String::new()),
            error_file: Some(String::new()),
            opencode_attempt_dir: Some(String::new()),
            opencode_config_dir: Some(String::new()),
            opencode_data_dir: Some(String::new()),
            attempt: Some(record.attempt + 1),
        },
    )?;

    println!("Task retried: {task_id} (attempt {})", record.attempt + 1);
    Ok(0)
}

pub fn approve(paths: &QueuePaths, task_id: &str) -> Result<i32> {
    let store = open_store(paths)?;
    let record = require(&store, task_id)?;

    if record.status != TaskStatus::Review {
        bail!(
            "Can only approve tasks in 'review' status, current status: {}",
            record.status
        );
    }

    store.update(task_id, &RecordPatch::status(TaskStatus::Done))?;
    println!("Task approved: {task_id}");
    Ok(0)
}

fn require(store: &QueueStore, task_id: &str) -> Result<TaskRecord> {
    match store.get(task_id)? {
        Some(record) => Ok(record),
        None => bail!("Task not found: {task_id}"),
    }
}
