use serde::{Deserialize, Serialize};

/// Task lifecycle states.
///
/// ```text
/// todo     → planning | cancelled
/// planning → building | failed | cancelled
/// building → review   | failed
/// review   → done     | cancelled
/// failed   → todo (retry) | cancelled
/// ```
/// `done` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Planning,
    Building,
    Review,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// All states, in the display order used by `taskq status`.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Todo,
        TaskStatus::Planning,
        TaskStatus::Building,
        TaskStatus::Review,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Planning => "planning",
            TaskStatus::Building => "building",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::{Building, Cancelled, Done, Failed, Planning, Review, Todo};
        matches!(
            (self, to),
            (Todo, Planning | Cancelled)
                | (Planning, Building | Failed | Cancelled)
                | (Building, Review | Failed)
                | (Review, Done | Cancelled)
                | (Failed, Todo | Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable runtime record for one task. One JSON object per line in
/// `queue/tasks.jsonl`; line order is the canonical queue order.
///
/// Fields not known to this build are carried in `extra` and re-emitted
/// verbatim, so newer record files survive a round trip through an older
/// binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub repo: String,
    pub base: String,
    pub task_file: String,
    pub status: TaskStatus,
    pub branch: String,
    pub worktree_path: String,
    pub container: String,
    pub port: u16,
    pub session_id: String,
    pub attempt: u32,
    pub error_file: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub opencode_attempt_dir: String,
    #[serde(default)]
    pub opencode_config_dir: String,
    #[serde(default)]
    pub opencode_data_dir: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    /// Fresh record for a newly added task, with no runtime handles.
    pub fn new_todo(
        id: impl Into<String>,
        repo: impl Into<String>,
        base: impl Into<String>,
        task_file: impl Into<String>,
        branch: impl Into<String>,
        worktree_path: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        TaskRecord {
            id: id.into(),
            repo: repo.into(),
            base: base.into(),
            task_file: task_file.into(),
            status: TaskStatus::Todo,
            branch: branch.into(),
            worktree_path: worktree_path.into(),
            container: String::new(),
            port: 0,
            session_id: String::new(),
            attempt: 0,
            error_file: String::new(),
            created_at: now.clone(),
            updated_at: now,
            opencode_attempt_dir: String::new(),
            opencode_config_dir: String::new(),
            opencode_data_dir: String::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Partial update applied by [`QueueStore::update`](super::QueueStore::update).
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub status: Option<TaskStatus>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub container: Option<String>,
    pub port: Option<u16>,
    pub session_id: Option<String>,
    pub attempt: Option<u32>,
    pub error_file: Option<String>,
    pub opencode_attempt_dir: Option<String>,
    pub opencode_config_dir: Option<String>,
    pub opencode_data_dir: Option<String>,
}

impl RecordPatch {
    pub fn status(status: TaskStatus) -> Self {
        RecordPatch {
            status: Some(status),
            ..RecordPatch::default()
        }
    }

    pub(super) fn apply(&self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(ref branch) = self.branch {
            record.branch = branch.clone();
        }
        if let Some(ref worktree_path) = self.worktree_path {
            record.worktree_path = worktree_path.clone();
        }
        if let Some(ref container) = self.container {
            record.container = container.clone();
        }
        if let Some(port) = self.port {
            record.port = port;
        }
        if let Some(ref session_id) = self.session_id {
            record.session_id = session_id.clone();
        }
        if let Some(attempt) = self.attempt {
            record.attempt = attempt;
        }
        if let Some(ref error_file) = self.error_file {
            record.error_file = error_file.clone();
        }
        if let Some(ref dir) = self.opencode_attempt_dir {
            record.opencode_attempt_dir = dir.clone();
        }
        if let Some(ref dir) = self.opencode_config_dir {
            record.opencode_config_dir = dir.clone();
        }
        if let Some(ref dir) = self.opencode_data_dir {
            record.opencode_data_dir = dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_the_machine() {
        use TaskStatus::{Building, Cancelled, Done, Failed, Planning, Review, Todo};

        let legal = [
            (Todo, Planning),
            (Todo, Cancelled),
            (Planning, Building),
            (Planning, Failed),
            (Planning, Cancelled),
            (Building, Review),
            (Building, Failed),
            (Review, Done),
            (Review, Cancelled),
            (Failed, Todo),
            (Failed, Cancelled),
        ];

        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {}",
                    if expected { "legal" } else { "illegal" }
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in TaskStatus::ALL {
            assert!(!TaskStatus::Done.can_transition_to(to));
            assert!(!TaskStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn status_round_trips_as_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Planning).unwrap();
        assert_eq!(json, "\"planning\"");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskStatus::Planning);
    }

    #[test]
    fn record_preserves_unknown_fields() {
        let line = r#"{"id":"T-001","repo":"/r","base":"main","task_file":"t.md",
            "status":"todo","branch":"task/t-001","worktree_path":"/w","container":"",
            "port":0,"session_id":"","attempt":0,"error_file":"","created_at":"c",
            "updated_at":"u","opencode_attempt_dir":"","opencode_config_dir":"",
            "opencode_data_dir":"","future_field":"kept"}"#;
        let record: TaskRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.extra["future_field"], "kept");

        let emitted = serde_json::to_string(&record).unwrap();
        assert!(emitted.contains("\"future_field\":\"kept\""));
    }

    #[test]
    fn record_loads_without_sandbox_fields() {
        let line = r#"{"id":"T-001","repo":"/r","base":"main","task_file":"t.md",
            "status":"todo","branch":"","worktree_path":"","container":"",
            "port":0,"session_id":"","attempt":0,"error_file":"","created_at":"c",
            "updated_at":"u"}"#;
        let record: TaskRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.opencode_attempt_dir, "");
        assert_eq!(record.opencode_config_dir, "");
        assert_eq!(record.opencode_data_dir, "");
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut record = TaskRecord::new_todo("T-001", "/r", "main", "t.md", "task/t-001", "/w");
        let patch = RecordPatch {
            container: Some("abc123".to_string()),
            port: Some(30001),
            ..RecordPatch::default()
        };
        patch.apply(&mut record);

        assert_eq!(record.container, "abc123");
        assert_eq!(record.port, 30001);
        assert_eq!(record.branch, "task/t-001");
        assert_eq!(record.status, TaskStatus::Todo);
    }
}
