//! Deterministic names derived from a task id and its creation time:
//! branch names, container names, and compact timestamps.

/// Derive the default git branch name for a task.
/// Format: `task/<lowercased-id>` with spaces and underscores hyphenated.
pub fn derive_branch_name(task_id: &str) -> String {
    let safe_id: String = task_id
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .collect();
    format!("task/{safe_id}")
}

/// Derive the deterministic container name for a task.
/// Format: `task-<safe-id>-<compact-created-at>`.
pub fn derive_container_name(task_id: &str, created_at: &str) -> String {
    let safe = sanitize_task_id(task_id);
    format!("task-{safe}-{}", compact_timestamp(created_at))
}

/// Anchored name prefix shared by every container of one task.
///
/// Includes the trailing separator so that a task id which happens to be a
/// prefix of another id (`T-1` vs `T-10`) cannot match the other task's
/// containers.
pub fn container_name_prefix(task_id: &str) -> String {
    format!("task-{}-", sanitize_task_id(task_id))
}

/// Replace runs of characters outside `[A-Za-z0-9_.-]` with a single hyphen.
fn sanitize_task_id(task_id: &str) -> String {
    let mut safe = String::with_capacity(task_id.len());
    let mut in_run = false;
    for c in task_id.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
            safe.push(c);
            in_run = false;
        } else if !in_run {
            safe.push('-');
            in_run = true;
        }
    }
    let trimmed = safe.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Compact an ISO-8601 timestamp to its digits (`YYYYMMDDHHMMSS`).
/// Falls back to whatever digits are present, or `"ts"` for none.
pub fn compact_timestamp(value: &str) -> String {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.len() >= 14 {
        digits[..14].to_string()
    } else if !digits.is_empty() {
        digits
    } else {
        "ts".to_string()
    }
}
