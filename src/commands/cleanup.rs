//! `taskq cleanup`: tear down runtime artifacts of settled tasks.

use std::path::Path;

use anyhow::{Result, bail};

use crate::paths::QueuePaths;
use crate::runtime::{docker, git};
use crate::store::{QueueStore, RecordPatch, TaskRecord, TaskStatus};

use super::open_store;

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub id: Option<String>,
    pub done_only: bool,
    pub cancelled_only: bool,
    pub keep_worktree: bool,
}

pub fn cleanup(paths: &QueuePaths, opts: &CleanupOptions) -> Result<i32> {
    if opts.done_only && opts.cancelled_only {
        bail!("Cannot use both --done-only and --cancelled-only");
    }

    let statuses: &[TaskStatus] = if opts.done_only {
        &[TaskStatus::Done]
    } else if opts.cancelled_only {
        &[TaskStatus::Cancelled]
    } else {
        &[TaskStatus::Done, TaskStatus::Cancelled]
    };

    let store = open_store(paths)?;

    let records: Vec<TaskRecord> = if let Some(ref task_id) = opts.id {
        let Some(record) = store.get(task_id)? else {
            bail!("Task not found: {task_id}");
        };
        if statuses.contains(&record.status) {
            vec![record]
        } else {
            Vec::new()
        }
    } else {
        let mut records = Vec::new();
        for status in statuses {
            records.extend(store.list_by_status(*status)?);
        }
        records
    };

    if records.is_empty() {
        println!("No tasks to clean up");
        return Ok(0);
    }

    println!("Cleaning up {} task(s)...", records.len());

    let mut cleaned = 0;
    let mut failed = 0;
    for record in &records {
        match cleanup_task_artifacts(paths, &store, record, opts.keep_worktree) {
            Ok(()) => {
                cleaned += 1;
                println!("  [ok] Cleaned {}", record.id);
            }
            Err(e) => {
                failed += 1;
                eprintln!("  [error] Failed to clean {}: {e}", record.id);
            }
        }
    }

    println!("\nCleaned: {cleaned}, Failed: {failed}");
    Ok(i32::from(failed > 0))
}

/// Remove one task's containers, worktree, error file, and per-attempt
/// sandboxes, then clear the runtime-handle fields. Sub-step failures are
/// logged and do not abort the remaining steps.
fn cleanup_task_artifacts(
    paths: &QueuePaths,
    store: &QueueStore,
    record: &TaskRecord,
    keep_worktree: bool,
) -> Result<()> {
    if !record.container.is_empty() {
        match docker::cleanup_task_containers(&record.id) {
            Ok(n) => tracing::debug!(task = %record.id, "removed {n} container(s)"),
            Err(e) => tracing::warn!(task = %record.id, "failed to remove containers: {e}"),
        }
    }

    if !keep_worktree && !record.worktree_path.is_empty() {
        let repo = Path::new(&record.repo);
        let worktree = Path::new(&record.worktree_path);
        if let Err(e) = git::remove_worktree(repo, worktree, true) {
            tracing::warn!(task = %record.id, "failed to remove worktree: {e}");
        }
    }

    if !record.error_file.is_empty() {
        let error_path = Path::new(&record.error_file);
        if error_path.exists()
            && let Err(e) = std::fs::remove_file(error_path)
        {
            tracing::warn!(task = %record.id, "failed to remove error file: {e}");
        }
    }

    let sandbox = paths.task_sandbox_dir(&record.id);
    if sandbox.exists()
        && let Err(e) = std::fs::remove_dir_all(&sandbox)
    {
        tracing::warn!(task = %record.id, "failed to remove sandbox: {e}");
    }

    store.update(
        &record.id,
        &RecordPatch {
            branch: Some(String::new()),
            worktree_path: Some(String::new()),
            container: Some(String::new()),
            port: Some(0),
            session_id: Some(String::new()),
            error_file: Some(String::new()),
            opencode_attempt_dir: Some(String::new()),
            opencode_config_dir: Some(String::new()),
            opencode_data_dir: Some(String::new()),
            ..RecordPatch::default()
        },
    )?;
    Ok(())
}
