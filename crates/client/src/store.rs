use crate::error::{ClientError, Result};
use crate::task::{TaskRecord, TaskStatus};
use log::{debug, warn};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

const LOCK_STRIPES: usize = 16;

/// Durable task store: one JSON file per record in the state directory,
/// named `<local_id>.json`, plus an in-memory index from `current_task_id`
/// to `local_id` so inbound events can be resolved without scanning disk.
///
/// Writes are atomic per record: the new content goes to a `.tmp` sibling
/// which is then renamed over the record file. A crash mid-update leaves
/// either the old record or the new one, never a truncated file.
pub struct TaskStore {
    state_dir: PathBuf,
    /// current_task_id -> local_id
    index: RwLock<HashMap<String, String>>,
    /// Read-modify-write serialization, striped by local_id so unrelated
    /// tasks do not contend on one lock.
    stripes: Vec<Mutex<()>>,
}

impl TaskStore {
    /// Open (or create) a store rooted at `state_dir` and rebuild the
    /// current-id index from the records on disk.
    pub fn open(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;

        let store = Self {
            state_dir: state_dir.to_path_buf(),
            index: RwLock::new(HashMap::new()),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        };

        let mut index = HashMap::new();
        for record in store.list_all()? {
            index.insert(record.current_task_id.clone(), record.local_id.clone());
        }
        debug!("task store opened with {} records", index.len());
        *store.index.write().expect("index lock poisoned") = index;

        Ok(store)
    }

    fn record_path(&self, local_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", local_id))
    }

    fn stripe(&self, local_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        local_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    fn write_record(&self, record: &TaskRecord) -> Result<()> {
        let path = self.record_path(&record.local_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_record(&self, local_id: &str) -> Result<TaskRecord> {
        let path = self.record_path(local_id);
        if !path.exists() {
            return Err(ClientError::TaskNotFound {
                task_id: local_id.to_string(),
            });
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Resolve a `current_task_id` to the owning `local_id`.
    fn resolve(&self, current_task_id: &str) -> Result<String> {
        self.index
            .read()
            .expect("index lock poisoned")
            .get(current_task_id)
            .cloned()
            .ok_or_else(|| ClientError::TaskNotFound {
                task_id: current_task_id.to_string(),
            })
    }

    /// Persist a new or replaced record and index it.
    pub fn put(&self, record: &TaskRecord) -> Result<()> {
        let _guard = self.stripe(&record.local_id).lock().expect("stripe poisoned");
        self.write_record(record)?;
        self.index
            .write()
            .expect("index lock poisoned")
            .insert(record.current_task_id.clone(), record.local_id.clone());
        Ok(())
    }

    pub fn get(&self, local_id: &str) -> Result<TaskRecord> {
        self.read_record(local_id)
    }

    pub fn get_by_current(&self, current_task_id: &str) -> Result<TaskRecord> {
        let local_id = self.resolve(current_task_id)?;
        self.read_record(&local_id)
    }

    /// Load every record in the state directory. Unreadable files are
    /// skipped with a warning rather than failing the whole listing.
    pub fn list_all(&self) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read task file {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<TaskRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Failed to parse task file {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    /// Rewrite the record's identifier mapping after the remote service
    /// confirms creation: `server_task_id` is set and `current_task_id`
    /// becomes the server value. The disk write is the commit point; the
    /// in-memory index is only updated after the rename succeeds, so a
    /// reload after a crash never sees a mapped index entry without the
    /// persisted record behind it.
    pub fn update_identifier_mapping(
        &self,
        local_id: &str,
        server_task_id: &str,
        batch_id: Option<&str>,
    ) -> Result<()> {
        let _guard = self.stripe(local_id).lock().expect("stripe poisoned");
        let mut record = self.read_record(local_id)?;
        let old_current = record.current_task_id.clone();

        record.server_task_id = Some(server_task_id.to_string());
        record.current_task_id = server_task_id.to_string();
        if let Some(batch) = batch_id {
            record.batch_id = Some(batch.to_string());
        }
        self.write_record(&record)?;

        let mut index = self.index.write().expect("index lock poisoned");
        index.remove(&old_current);
        index.insert(server_task_id.to_string(), local_id.to_string());
        debug!(
            "task {}: identifier mapping {} -> {}",
            local_id, old_current, server_task_id
        );
        Ok(())
    }

    /// Update status (and optional error detail) for the task currently
    /// keyed by `current_task_id`. Unknown ids are a `TaskNotFound` error,
    /// never a silent insert.
    pub fn update_status(
        &self,
        current_task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let local_id = self.resolve(current_task_id)?;
        let _guard = self.stripe(&local_id).lock().expect("stripe poisoned");
        let mut record = self.read_record(&local_id)?;
        record.status = status;
        if let Some(message) = error {
            record.last_error = Some(message.to_string());
        }
        if status == TaskStatus::Completed {
            record.progress = 100;
            record.phase = "completed".to_string();
        }
        self.write_record(&record)
    }

    /// Update the in-flight progress snapshot (status, phase tag, percent).
    pub fn update_progress_state(
        &self,
        current_task_id: &str,
        status: TaskStatus,
        phase: &str,
        progress: u8,
    ) -> Result<()> {
        let local_id = self.resolve(current_task_id)?;
        let _guard = self.stripe(&local_id).lock().expect("stripe poisoned");
        let mut record = self.read_record(&local_id)?;
        record.status = status;
        record.phase = phase.to_string();
        record.progress = progress.min(100);
        self.write_record(&record)
    }

    /// Mark a task's output as downloaded to `local_path`.
    pub fn update_download_state(&self, current_task_id: &str, local_path: &Path) -> Result<()> {
        let local_id = self.resolve(current_task_id)?;
        let _guard = self.stripe(&local_id).lock().expect("stripe poisoned");
        let mut record = self.read_record(&local_id)?;
        record.is_downloaded = true;
        record.local_output_path = Some(local_path.to_path_buf());
        record.downloaded_at = Some(chrono::Utc::now());
        self.write_record(&record)
    }

    /// Clear download bookkeeping after the integrity checker finds the
    /// file missing on disk.
    pub fn clear_download_state(&self, current_task_id: &str) -> Result<()> {
        let local_id = self.resolve(current_task_id)?;
        let _guard = self.stripe(&local_id).lock().expect("stripe poisoned");
        let mut record = self.read_record(&local_id)?;
        record.is_downloaded = false;
        record.local_output_path = None;
        record.downloaded_at = None;
        self.write_record(&record)
    }

    /// Consume one retry attempt: reset the task to Pending for
    /// resubmission. Fails once the budget is exhausted.
    pub fn mark_retry(&self, current_task_id: &str) -> Result<TaskRecord> {
        let local_id = self.resolve(current_task_id)?;
        let _guard = self.stripe(&local_id).lock().expect("stripe poisoned");
        let mut record = self.read_record(&local_id)?;
        if record.retry_count >= record.max_retries {
            return Err(ClientError::RetriesExhausted {
                task_id: current_task_id.to_string(),
                max_retries: record.max_retries,
            });
        }
        record.retry_count += 1;
        record.status = TaskStatus::Pending;
        record.phase = "pending".to_string();
        record.progress = 0;
        record.last_error = None;
        self.write_record(&record)?;
        Ok(record)
    }

    /// Remove a record. Deletion is an explicit user action; nothing in
    /// the core removes records automatically.
    pub fn remove(&self, local_id: &str) -> Result<()> {
        let _guard = self.stripe(local_id).lock().expect("stripe poisoned");
        let record = self.read_record(local_id)?;
        fs::remove_file(self.record_path(local_id))?;
        self.index
            .write()
            .expect("index lock poisoned")
            .remove(&record.current_task_id);
        Ok(())
    }
}
