//! `taskq review`: attach the interactive review TUI to a task's
//! container endpoint.

use anyhow::{Result, bail};

use crate::paths::QueuePaths;
use crate::runtime::review::{ReviewError, launch_review_from_record};
use crate::store::TaskStatus;

use super::open_store;

pub fn review(paths: &QueuePaths, task_id: &str) -> Result<i32> {
    let store = open_store(paths)?;

    let Some(record) = store.get(task_id)? else {
        bail!("Task not found: {task_id}");
    };
    if record.status != TaskStatus::Review {
        bail!(
            "Can only review tasks in 'review' status, current status: {}",
            record.status
        );
    }
    if record.port == 0 {
        bail!("Task does not have a valid port allocated: {}", record.port);
    }

    println!("Launching review for task: {task_id}");
    match launch_review_from_record(&record) {
        Ok(exit_code) => Ok(exit_code),
        Err(e @ ReviewError::StrictLocal { .. }) => {
            eprintln!("Error: {e}");
            eprintln!("Suggestion: retry and rerun the task to repopulate the strict-local sandbox:");
            eprintln!("  taskq retry --id {task_id}");
            eprintln!("  taskq run --id {task_id}");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RecordPatch, TaskRecord};

    fn scratch() -> (tempfile::TempDir, QueuePaths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = QueuePaths::new(tmp.path());
        (tmp, paths)
    }

    fn seed(paths: &QueuePaths, status: TaskStatus, port: u16) {
        let store = open_store(paths).unwrap();
        let mut record = TaskRecord::new_todo(
            "T-001",
            "/repos/demo",
            "main",
            "queue/tasks/T-001.md",
            "task/t-001",
            "/wt",
        );
        record.status = status;
        record.port = port;
        store.add(record).unwrap();
    }

    #[test]
    fn review_requires_an_existing_task_in_review() {
        let (_tmp, paths) = scratch();
        assert!(review(&paths, "T-404").unwrap_err().to_string().contains("not found"));

        seed(&paths, TaskStatus::Todo, 30001);
        let err = review(&paths, "T-001").unwrap_err();
        assert!(err.to_string().contains("'review' status"));
    }

    #[test]
    fn review_requires_an_allocated_port() {
        let (_tmp, paths) = scratch();
        seed(&paths, TaskStatus::Review, 0);
        let err = review(&paths, "T-001").unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn review_refuses_missing_sandbox_with_remediation_exit_code() {
        let (_tmp, paths) = scratch();
        seed(&paths, TaskStatus::Review, 30001);
        // Sandbox fields never populated → strict-local refusal, exit 1
        assert_eq!(review(&paths, "T-001").unwrap(), 1);
    }

    #[test]
    fn review_refuses_dangling_sandbox_paths() {
        let (_tmp, paths) = scratch();
        seed(&paths, TaskStatus::Review, 30001);
        let store = open_store(&paths).unwrap();
        store
            .update(
                "T-001",
                &RecordPatch {
                    opencode_config_dir: Some("/definitely/gone/config".to_string()),
                    opencode_data_dir: Some("/definitely/gone/data".to_string()),
                    ..RecordPatch::default()
                },
            )
            .unwrap();

        assert_eq!(review(&paths, "T-001").unwrap(), 1);
    }
}
