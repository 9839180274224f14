//! `taskq run`: claim and execute queued tasks with a worker pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::paths::QueuePaths;
use crate::pipeline::TaskProcessor;
use crate::store::{QueueStore, TaskRecord, TaskStatus};

use super::open_store;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub id: Option<String>,
    pub max_parallel: usize,
    /// Poll interval in seconds; `None` means a single pass.
    pub poll: Option<u64>,
    pub cleanup_on_fail: bool,
    pub dirty_run: bool,
    pub follow: bool,
}

pub fn run(paths: &QueuePaths, opts: &RunOptions) -> Result<i32> {
    if let Some(interval) = opts.poll
        && interval == 0
    {
        bail!("--poll must be greater than 0");
    }
    if opts.id.is_some() && opts.poll.is_some() {
        bail!("--id cannot be combined with --poll");
    }
    if opts.max_parallel == 0 {
        bail!("--max-parallel must be greater than 0");
    }

    let store = Arc::new(open_store(paths)?);

    // Short random tag stamped into every record this invocation touches.
    let session_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

    println!("Starting task queue runner (session: {session_id})");
    println!("  Max parallel workers: {}", opts.max_parallel);
    match opts.poll {
        Some(interval) => println!("  Polling: enabled ({interval}s)"),
        None => println!("  Polling: disabled (single pass)"),
    }
    println!(
        "  On failure cleanup: {}",
        if opts.cleanup_on_fail {
            "enabled (--cleanup-on-fail)"
        } else {
            "disabled"
        }
    );
    println!(
        "  Dirty rerun mode: {}",
        if opts.dirty_run {
            "enabled (--dirty-run)"
        } else {
            "disabled"
        }
    );
    println!(
        "  Log streaming: {}",
        if opts.follow {
            "enabled (--follow)"
        } else {
            "disabled (use --follow to stream worker logs)"
        }
    );

    let processor = TaskProcessor::new(Arc::clone(&store), paths.clone(), session_id)
        .cleanup_on_fail(opts.cleanup_on_fail)
        .dirty_run(opts.dirty_run);

    if let Some(ref task_id) = opts.id {
        println!("  Task filter: {task_id}");
        return run_single(&store, &processor, task_id);
    }

    let mut all_successful = true;
    let mut iteration = 0u32;

    loop {
        iteration += 1;
        println!("\n[Iteration {iteration}] Claiming tasks...");

        let mut batch = Vec::new();
        for _ in 0..opts.max_parallel {
            match store.claim_first_todo()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }

        if batch.is_empty() {
            println!("No tasks to process.");
            let Some(interval) = opts.poll else {
                println!("Queue empty (single-pass mode).");
                break;
            };
            println!("Waiting {interval}s before next poll...");
            std::thread::sleep(Duration::from_secs(interval));
            continue;
        }

        let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
        println!("Claimed {} task(s): {ids:?}", batch.len());

        let failed = process_batch(&processor, batch);
        if failed > 0 {
            all_successful = false;
            println!("[Iteration {iteration}] {failed} task(s) failed");
        }

        let Some(interval) = opts.poll else {
            break;
        };
        println!("Waiting {interval}s before next poll...");
        std::thread::sleep(Duration::from_secs(interval));
    }

    Ok(i32::from(!all_successful))
}

fn run_single(store: &QueueStore, processor: &TaskProcessor, task_id: &str) -> Result<i32> {
    let Some(claimed) = store.claim_todo_by_id(task_id)? else {
        match store.get(task_id)? {
            None => bail!("Task not found: {task_id}"),
            Some(existing) => bail!(
                "Task {task_id} is not in 'todo' status (current: {})",
                existing.status
            ),
        }
    };

    let failed = process_batch(processor, vec![claimed]);
    Ok(i32::from(failed > 0))
}

/// Process one claimed batch on dedicated worker threads, one pipeline
/// per record. Returns the number of tasks that did not reach `review`.
fn process_batch(processor: &TaskProcessor, batch: Vec<TaskRecord>) -> usize {
    let outcomes: Vec<(String, std::thread::Result<TaskStatus>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = batch
            .into_iter()
            .map(|record| {
                let id = record.id.clone();
                let handle = scope.spawn(move || processor.process(record).status);
                (id, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(id, handle)| (id, handle.join()))
            .collect()
    });

    let mut failed = 0;
    for (id, outcome) in outcomes {
        match outcome {
            Ok(status) => {
                println!("  Task {id}: {status}");
                if status == TaskStatus::Failed {
                    failed += 1;
                }
            }
            Err(panic) => {
                // A pipeline bug, not a task failure: persist a synthetic
                // failed transition so the record stays operator-actionable,
                // and keep the runner alive.
                let message = panic_message(&panic);
                eprintln!("  Task {id}: ERROR - {message}");
                processor.fail_synthetic(&id, &message);
                failed += 1;
            }
        }
    }
    failed
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming;

    fn scratch() -> (tempfile::TempDir, QueuePaths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = QueuePaths::new(tmp.path());
        paths.ensure_dirs().unwrap();
        (tmp, paths)
    }

    fn seed_todo(paths: &QueuePaths, id: &str) {
        let store = open_store(paths).unwrap();
        store
            .add(TaskRecord::new_todo(
                id,
                "/repos/demo",
                "main",
                format!("queue/tasks/{id}.md"),
                naming::derive_branch_name(id),
                "/wt",
            ))
            .unwrap();
    }

    #[test]
    fn conflicting_and_invalid_flags_are_rejected() {
        let (_tmp, paths) = scratch();

        let err = run(
            &paths,
            &RunOptions {
                id: Some("T-001".to_string()),
                max_parallel: 3,
                poll: Some(5),
                ..RunOptions::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("--id cannot be combined"));

        let err = run(
            &paths,
            &RunOptions {
                max_parallel: 3,
                poll: Some(0),
                ..RunOptions::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("--poll"));
    }

    #[test]
    fn single_pass_on_empty_queue_succeeds() {
        let (_tmp, paths) = scratch();
        let code = run(
            &paths,
            &RunOptions {
                max_parallel: 3,
                ..RunOptions::default()
            },
        )
        .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn single_id_requires_a_todo_record() {
        let (_tmp, paths) = scratch();

        let err = run(
            &paths,
            &RunOptions {
                id: Some("T-404".to_string()),
                max_parallel: 1,
                ..RunOptions::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("Task not found"));

        seed_todo(&paths, "T-001");
        let store = open_store(&paths).unwrap();
        store.claim_todo_by_id("T-001").unwrap();
        let err = run(
            &paths,
            &RunOptions {
                id: Some("T-001".to_string()),
                max_parallel: 1,
                ..RunOptions::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("not in 'todo' status"));
    }

    #[test]
    fn single_pass_claims_and_settles_every_todo() {
        // Records with no task files fail in setup; what matters here is
        // that the pass claims each todo exactly once and settles them.
        let (_tmp, paths) = scratch();
        for id in ["T-001", "T-002", "T-003"] {
            seed_todo(&paths, id);
        }

        let code = run(
            &paths,
            &RunOptions {
                max_parallel: 3,
                ..RunOptions::default()
            },
        )
        .unwrap();
        assert_eq!(code, 1);

        let store = open_store(&paths).unwrap();
        assert!(store.list_by_status(TaskStatus::Todo).unwrap().is_empty());
        assert_eq!(store.list_by_status(TaskStatus::Failed).unwrap().len(), 3);
        for record in store.list().unwrap() {
            assert!(!record.session_id.is_empty() || record.status == TaskStatus::Failed);
        }
    }
}
