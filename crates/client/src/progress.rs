use crate::error::{ClientError, Result};
use crate::store::TaskStore;
use crate::task::TaskStatus;
use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const LOCK_STRIPES: usize = 16;

pub type SubscriptionId = u64;

/// Change notification published to the rendering-layer collaborator after
/// every successful transition. The manager holds no UI references.
#[derive(Debug, Clone)]
pub enum ProgressNotice {
    Task {
        current_task_id: String,
        status: TaskStatus,
        phase: String,
        percent: u8,
        speed_bps: Option<f64>,
        eta_secs: Option<u64>,
        message: Option<String>,
    },
    Terminal {
        current_task_id: String,
        status: TaskStatus,
        message: Option<String>,
    },
    Batch {
        batch_id: String,
        overall_percent: u8,
        completed: usize,
        total: usize,
        current_file: String,
        current_file_progress: u8,
    },
}

type Callback = Box<dyn Fn(&ProgressNotice) + Send + Sync>;

/// Single mutable owner of each task's displayed status and progress.
///
/// Three uncoordinated producers feed it: submission-phase transfer
/// callbacks, push-channel conversion events and terminal notifications.
/// Per-task serialization uses striped locks keyed by `current_task_id` so
/// unrelated tasks never contend. The phase tag on an event is authoritative
/// over arrival order: a "converting"-tagged event always wins over a
/// late-queued "uploading" one.
pub struct ProgressManager {
    store: Arc<TaskStore>,
    stripes: Vec<Mutex<()>>,
    subscribers: RwLock<HashMap<SubscriptionId, Callback>>,
    next_subscription: AtomicU64,
}

impl ProgressManager {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self {
            store,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    fn stripe(&self, current_task_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        current_task_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    /// Register a change-notification callback. Callers must unsubscribe on
    /// teardown; the registry never drops entries on its own.
    pub fn subscribe(&self, callback: impl Fn(&ProgressNotice) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .insert(id, Box::new(callback));
        id
    }

    /// Remove a callback. Returns false if the id was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .remove(&id)
            .is_some()
    }

    fn publish(&self, notice: &ProgressNotice) {
        for callback in self.subscribers.read().expect("subscriber lock poisoned").values() {
            callback(notice);
        }
    }

    /// Apply a progress event for the task keyed by `current_task_id`.
    ///
    /// Percent is clamped to 0..=100. Terminal states are sticky: a stray
    /// late event after completion is a logged no-op. An unknown id is
    /// dropped without touching the store (a push event racing the
    /// identifier mapping lands here; progress resumes from the next event
    /// once the mapping is persisted).
    pub fn update_progress(
        &self,
        current_task_id: &str,
        percent: u32,
        phase: &str,
        speed_bps: Option<f64>,
        eta_secs: Option<u64>,
        message: Option<&str>,
    ) -> Result<()> {
        let _guard = self.stripe(current_task_id).lock().expect("stripe poisoned");

        let record = match self.store.get_by_current(current_task_id) {
            Ok(record) => record,
            Err(ClientError::TaskNotFound { .. }) => {
                warn!(
                    "Progress event for unknown task {} ({}%, phase {}), dropping",
                    current_task_id, percent, phase
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if record.status.is_terminal() {
            debug!(
                "Task {}: ignoring {} progress event in terminal state {:?}",
                current_task_id, phase, record.status
            );
            return Ok(());
        }

        let (status, effective_phase) = match phase {
            "uploading" | "upload_completed" => {
                if record.status == TaskStatus::Converting {
                    // Stale transfer-phase event arriving after the push
                    // channel took over; the phase tag wins.
                    debug!(
                        "Task {}: stale uploading event after converting began, dropping",
                        current_task_id
                    );
                    return Ok(());
                }
                if percent >= 100 {
                    (TaskStatus::Uploading, "upload_completed")
                } else {
                    (TaskStatus::Uploading, "uploading")
                }
            }
            "converting" => (TaskStatus::Converting, "converting"),
            other => (record.status, other),
        };

        let percent = percent.min(100) as u8;
        self.store
            .update_progress_state(current_task_id, status, effective_phase, percent)?;

        self.publish(&ProgressNotice::Task {
            current_task_id: current_task_id.to_string(),
            status,
            phase: effective_phase.to_string(),
            percent,
            speed_bps,
            eta_secs,
            message: message.map(str::to_string),
        });
        Ok(())
    }

    /// Terminal completion/failure notification. Transitions the task to
    /// Completed or Failed regardless of the phase it was last seen in.
    /// Idempotent: repeating the call with the same outcome is a no-op.
    pub fn on_task_completed(
        &self,
        current_task_id: &str,
        success: bool,
        message: Option<&str>,
    ) -> Result<()> {
        let _guard = self.stripe(current_task_id).lock().expect("stripe poisoned");

        let record = match self.store.get_by_current(current_task_id) {
            Ok(record) => record,
            Err(ClientError::TaskNotFound { .. }) => {
                warn!(
                    "Completion event for unknown task {} (success={}), dropping",
                    current_task_id, success
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let target = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        if record.status == target {
            debug!("Task {}: already {:?}, completion repeated", current_task_id, target);
            return Ok(());
        }
        if record.status.is_terminal() {
            // Conflicting terminal outcomes are left to reconciliation,
            // which has the authoritative remote view.
            warn!(
                "Task {}: completion event ({:?}) conflicts with terminal state {:?}, keeping local",
                current_task_id, target, record.status
            );
            return Ok(());
        }

        self.store.update_status(current_task_id, target, message)?;
        info!("Task {}: terminal transition to {:?}", current_task_id, target);

        self.publish(&ProgressNotice::Terminal {
            current_task_id: current_task_id.to_string(),
            status: target,
            message: message.map(str::to_string),
        });
        Ok(())
    }

    /// Aggregate progress over one submission batch. Purely a notification:
    /// no individual task record is mutated.
    pub fn update_batch_progress(
        &self,
        batch_id: &str,
        overall_percent: u32,
        completed: usize,
        total: usize,
        current_file: &str,
        current_file_progress: u32,
    ) {
        self.publish(&ProgressNotice::Batch {
            batch_id: batch_id.to_string(),
            overall_percent: overall_percent.min(100) as u8,
            completed,
            total,
            current_file: current_file.to_string(),
            current_file_progress: current_file_progress.min(100) as u8,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRecord;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<TaskStore>, ProgressManager, TaskRecord) {
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let rec = TaskRecord::new(
            PathBuf::from("/media/p.mkv"),
            "p.mkv".to_string(),
            4096,
            serde_json::Value::Null,
            3,
        );
        store.put(&rec).unwrap();
        store
            .update_identifier_mapping(&rec.local_id, "srv-p", None)
            .unwrap();
        let manager = ProgressManager::new(Arc::clone(&store));
        let rec = store.get(&rec.local_id).unwrap();
        (store, manager, rec)
    }

    #[test]
    fn upload_then_convert_transitions() {
        let dir = TempDir::new().unwrap();
        let (store, manager, rec) = setup(&dir);

        manager
            .update_progress("srv-p", 30, "uploading", Some(1e6), Some(12), None)
            .unwrap();
        let loaded = store.get(&rec.local_id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Uploading);
        assert_eq!(loaded.progress, 30);

        // Transfer channel saturates at 100.
        manager
            .update_progress("srv-p", 100, "uploading", None, None, None)
            .unwrap();
        let loaded = store.get(&rec.local_id).unwrap();
        assert_eq!(loaded.phase, "upload_completed");
        assert_eq!(loaded.status, TaskStatus::Uploading);

        // First push event starts the converting phase from its own percent.
        manager
            .update_progress("srv-p", 5, "converting", None, None, None)
            .unwrap();
        let loaded = store.get(&rec.local_id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Converting);
        assert_eq!(loaded.progress, 5);
    }

    #[test]
    fn phase_tag_wins_over_arrival_order() {
        let dir = TempDir::new().unwrap();
        let (store, manager, rec) = setup(&dir);

        manager
            .update_progress("srv-p", 10, "converting", None, None, None)
            .unwrap();
        // A queued transfer event arrives late; it must not revert status.
        manager
            .update_progress("srv-p", 95, "uploading", None, None, None)
            .unwrap();

        let loaded = store.get(&rec.local_id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Converting);
        assert_eq!(loaded.progress, 10);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let dir = TempDir::new().unwrap();
        let (store, manager, rec) = setup(&dir);

        manager.on_task_completed("srv-p", true, None).unwrap();
        manager
            .update_progress("srv-p", 55, "converting", None, None, None)
            .unwrap();

        let loaded = store.get(&rec.local_id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.progress, 100);
    }

    #[test]
    fn completion_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (_store, manager, _rec) = setup(&dir);

        let notices = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notices);
        manager.subscribe(move |notice| {
            if matches!(notice, ProgressNotice::Terminal { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        manager.on_task_completed("srv-p", false, Some("boom")).unwrap();
        manager.on_task_completed("srv-p", false, Some("boom")).unwrap();
        assert_eq!(notices.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn percent_clamped_to_hundred() {
        let dir = TempDir::new().unwrap();
        let (store, manager, rec) = setup(&dir);

        manager
            .update_progress("srv-p", 250, "converting", None, None, None)
            .unwrap();
        assert_eq!(store.get(&rec.local_id).unwrap().progress, 100);
    }

    #[test]
    fn unknown_id_is_dropped_without_store_writes() {
        let dir = TempDir::new().unwrap();
        let (store, manager, _rec) = setup(&dir);

        manager
            .update_progress("not-mapped-yet", 40, "converting", None, None, None)
            .unwrap();
        manager.on_task_completed("not-mapped-yet", true, None).unwrap();

        // Only the record from setup exists; nothing was silently created.
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn progress_resumes_after_mapping_lands() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let rec = TaskRecord::new(
            PathBuf::from("/media/race.mkv"),
            "race.mkv".to_string(),
            4096,
            serde_json::Value::Null,
            3,
        );
        store.put(&rec).unwrap();
        let manager = ProgressManager::new(Arc::clone(&store));

        // Push event beats the submission response: the server id is not
        // mapped yet, so the event is dropped.
        manager
            .update_progress("srv-race", 15, "converting", None, None, None)
            .unwrap();
        assert_eq!(store.get(&rec.local_id).unwrap().progress, 0);

        // The mapping commits; the next event applies normally.
        store
            .update_identifier_mapping(&rec.local_id, "srv-race", None)
            .unwrap();
        manager
            .update_progress("srv-race", 20, "converting", None, None, None)
            .unwrap();
        let loaded = store.get(&rec.local_id).unwrap();
        assert_eq!(loaded.progress, 20);
        assert_eq!(loaded.status, TaskStatus::Converting);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dir = TempDir::new().unwrap();
        let (_store, manager, _rec) = setup(&dir);

        let notices = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notices);
        let id = manager.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .update_progress("srv-p", 10, "uploading", None, None, None)
            .unwrap();
        assert!(manager.unsubscribe(id));
        manager
            .update_progress("srv-p", 20, "uploading", None, None, None)
            .unwrap();

        assert_eq!(notices.load(Ordering::SeqCst), 1);
        assert!(!manager.unsubscribe(id));
    }

    #[test]
    fn batch_progress_never_touches_records() {
        let dir = TempDir::new().unwrap();
        let (store, manager, rec) = setup(&dir);

        let before = store.get(&rec.local_id).unwrap();
        manager.update_batch_progress("batch-1", 60, 1, 3, "p.mkv", 80);
        let after = store.get(&rec.local_id).unwrap();

        assert_eq!(before.status, after.status);
        assert_eq!(before.progress, after.progress);
        assert_eq!(before.phase, after.phase);
    }
}
