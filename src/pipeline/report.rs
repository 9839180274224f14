//! Diagnostic reports written for failed tasks.

use std::fs;
use std::path::{Path, PathBuf};

use crate::store::TaskRecord;

/// Captured stdout/stderr is clipped to this many characters per section.
const OUTPUT_LIMIT: usize = 500;

/// Render the markdown failure report for one task.
pub fn generate_error_report(
    record: &TaskRecord,
    stage: &str,
    command: &str,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> String {
    format!(
        "# Task Failure Report\n\
         \n\
         - **Task**: {id}\n\
         - **Attempt**: {attempt}\n\
         - **Stage**: {stage}\n\
         - **Command**: {command}\n\
         - **Exit code**: {exit_code}\n\
         - **Branch**: {branch}\n\
         - **Worktree**: {worktree}\n\
         - **Timestamp**: {timestamp}\n\
         \n\
         ## Stdout\n\
         \n\
         ```\n{stdout}\n```\n\
         \n\
         ## Stderr\n\
         \n\
         ```\n{stderr}\n```\n",
        id = record.id,
        attempt = record.attempt,
        branch = or_empty_marker(&record.branch),
        worktree = or_empty_marker(&record.worktree_path),
        timestamp = chrono::Utc::now().to_rfc3339(),
        stdout = clip(stdout),
        stderr = clip(stderr),
    )
}

/// Write a report as `<errors_dir>/<task-id>-<unix-ts>.md`, creating the
/// directory when missing.
pub fn write_error_report(
    content: &str,
    task_id: &str,
    errors_dir: &Path,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(errors_dir)?;
    let path = errors_dir.join(format!("{task_id}-{}.md", chrono::Utc::now().timestamp()));
    fs::write(&path, content)?;
    Ok(path)
}

fn or_empty_marker(value: &str) -> &str {
    if value.is_empty() { "(empty)" } else { value }
}

/// Clip to [`OUTPUT_LIMIT`] characters on a char boundary.
fn clip(output: &str) -> &str {
    if output.is_empty() {
        return "(empty)";
    }
    match output.char_indices().nth(OUTPUT_LIMIT) {
        Some((idx, _)) => &output[..idx],
        None => output,
    }
}
