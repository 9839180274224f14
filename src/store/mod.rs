//! JSONL persistence for task records.
//!
//! One record per line; line order is the canonical queue order. Every
//! operation serializes through a process-local re-entrant mutex plus an
//! exclusive advisory lock on the record file, and commits through a
//! temp-file-then-rename so a crash mid-write never corrupts the file.

mod models;

pub use models::{RecordPatch, TaskRecord, TaskStatus};

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::ReentrantMutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record with id '{0}' already exists")]
    DuplicateId(String),

    #[error("Record with id '{0}' not found")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("attempt cannot decrease ({current} -> {requested})")]
    AttemptDecrease { current: u32, requested: u32 },

    #[error("error reading record file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Exclusive advisory lock on the record file, released on drop so every
/// exit path (including unwinding) gives the lock back.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!("failed to release record file lock: {e}");
        }
    }
}

/// Thread-safe JSONL queue store with file locking and atomic writes.
pub struct QueueStore {
    tasks_file: PathBuf,
    lock: ReentrantMutex<()>,
}

impl QueueStore {
    /// Open (and create if missing) the store at the given record file path.
    pub fn open(tasks_file: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let tasks_file = tasks_file.into();
        if let Some(parent) = tasks_file.parent() {
            fs::create_dir_all(parent)?;
        }
        if !tasks_file.exists() {
            fs::write(&tasks_file, b"")?;
        }
        Ok(QueueStore {
            tasks_file,
            lock: ReentrantMutex::new(()),
        })
    }

    pub fn tasks_file(&self) -> &Path {
        &self.tasks_file
    }

    /// Insert a new record. Fails if the id is already present.
    pub fn add(&self, record: TaskRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;

        let mut records = self.read_all()?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        records.push(record);
        self.write_all(&records)
    }

    /// Merge a patch into an existing record. A status change must be a
    /// legal transition; `updated_at` is refreshed on success.
    pub fn update(&self, record_id: &str, patch: &RecordPatch) -> Result<TaskRecord, StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;

        let mut records = self.read_all()?;
        let idx = records
            .iter()
            .position(|r| r.id == record_id)
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;

        let current = &records[idx];
        if let Some(new_status) = patch.status
            && new_status != current.status
            && !current.status.can_transition_to(new_status)
        {
            return Err(StoreError::InvalidTransition {
                from: current.status,
                to: new_status,
            });
        }
        if let Some(attempt) = patch.attempt
            && attempt < current.attempt
        {
            return Err(StoreError::AttemptDecrease {
                current: current.attempt,
                requested: attempt,
            });
        }

        patch.apply(&mut records[idx]);
        records[idx].updated_at = chrono::Utc::now().to_rfc3339();

        let updated = records[idx].clone();
        self.write_all(&records)?;
        Ok(updated)
    }

    /// Remove a record by id.
    pub fn remove(&self, record_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;

        let mut records = self.read_all()?;
        let before = records.len();
        records.retain(|r| r.id != record_id);
        if records.len() == before {
            return Err(StoreError::NotFound(record_id.to_string()));
        }
        self.write_all(&records)
    }

    pub fn get(&self, record_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;
        Ok(self.read_all()?.into_iter().find(|r| r.id == record_id))
    }

    pub fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;
        self.read_all()
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Atomically claim the first `todo` record in file order, moving it to
    /// `planning`. Returns `None` when nothing is claimable.
    pub fn claim_first_todo(&self) -> Result<Option<TaskRecord>, StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;

        let mut records = self.read_all()?;
        let Some(idx) = records.iter().position(|r| r.status == TaskStatus::Todo) else {
            return Ok(None);
        };
        records[idx].status = TaskStatus::Planning;
        records[idx].updated_at = chrono::Utc::now().to_rfc3339();

        let claimed = records[idx].clone();
        self.write_all(&records)?;
        Ok(Some(claimed))
    }

    /// Atomically claim a specific record, provided it is in `todo`.
    /// Returns `None` when the record is missing or not claimable.
    pub fn claim_todo_by_id(&self, record_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;

        let mut records = self.read_all()?;
        let Some(idx) = records.iter().position(|r| r.id == record_id) else {
            return Ok(None);
        };
        if records[idx].status != TaskStatus::Todo {
            return Ok(None);
        }
        records[idx].status = TaskStatus::Planning;
        records[idx].updated_at = chrono::Utc::now().to_rfc3339();

        let claimed = records[idx].clone();
        self.write_all(&records)?;
        Ok(Some(claimed))
    }

    /// Empty the record file. Testing only.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let _file_lock = FileLock::acquire(&self.tasks_file)?;
        self.write_all(&[])
    }

    /// Read every record. Must be called with both locks held.
    fn read_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let content = match fs::read_to_string(&self.tasks_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: TaskRecord = serde_json::from_str(line)
                .map_err(|e| StoreError::Corrupt(format!("line {}: {e}", lineno + 1)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Write every record through a sibling temp file and an atomic rename.
    /// Must be called with both locks held.
    fn write_all(&self, records: &[TaskRecord]) -> Result<(), StoreError> {
        let temp_file = self.tasks_file.with_extension("jsonl.tmp");

        let result = (|| -> Result<(), StoreError> {
            let mut out = File::create(&temp_file)?;
            for record in records {
                let line = serde_json::to_string(record)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.sync_all()?;
            fs::rename(&temp_file, &self.tasks_file)?;
            Ok(())
        })();

        if result.is_err() && temp_file.exists() {
            let _ = fs::remove_file(&temp_file);
        }
        result
    }
}
