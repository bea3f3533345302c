use crate::error::{ClientError, Result};
use crate::store::TaskStore;
use crate::task::{TaskRecord, TaskStatus};
use async_trait::async_trait;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// File descriptor handed to `submit`.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub path: PathBuf,
    pub display_name: String,
    pub bytes: u64,
}

/// Per-file result of a batch submission, keyed by the local id the batch
/// was built with. `Ok` carries the server-issued task identifier.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub local_id: String,
    pub result: std::result::Result<String, String>,
}

/// Remote submission boundary. Implementations own the wire protocol; the
/// core only sees per-file outcomes.
#[async_trait]
pub trait SubmissionApi: Send + Sync {
    async fn submit_batch(
        &self,
        batch_id: &str,
        files: &[(String, FileSpec)],
        params: &serde_json::Value,
    ) -> Result<Vec<SubmissionOutcome>>;

    async fn cancel(&self, task_id: &str) -> Result<()>;
}

/// Owns local identity generation and the submission protocol.
///
/// Ordering is the correctness property here: every record is persisted
/// Pending under its local id before the batch request goes out, and the
/// identifier rewrite happens only after the per-file confirmation. A crash
/// mid-submission therefore leaves each record either Pending/local-keyed
/// or fully mapped, never half way.
pub struct SubmissionManager {
    store: Arc<TaskStore>,
    api: Arc<dyn SubmissionApi>,
    timeout: Duration,
    max_retries: u32,
}

impl SubmissionManager {
    pub fn new(
        store: Arc<TaskStore>,
        api: Arc<dyn SubmissionApi>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            api,
            timeout,
            max_retries,
        }
    }

    /// Submit a set of files as one batch. Returns the local ids of the
    /// created records. On timeout or transport failure the records stay
    /// Pending on disk and the call is safe to re-invoke.
    pub async fn submit(
        &self,
        files: Vec<FileSpec>,
        params: serde_json::Value,
    ) -> Result<Vec<String>> {
        let batch_id = Uuid::new_v4().to_string();

        let mut batch = Vec::with_capacity(files.len());
        for file in files {
            let mut record = TaskRecord::new(
                file.path.clone(),
                file.display_name.clone(),
                file.bytes,
                params.clone(),
                self.max_retries,
            );
            record.batch_id = Some(batch_id.clone());
            self.store.put(&record)?;
            info!(
                "Task {}: created for {} ({} bytes)",
                record.local_id,
                file.path.display(),
                file.bytes
            );
            batch.push((record.local_id, file));
        }
        let local_ids: Vec<String> = batch.iter().map(|(id, _)| id.clone()).collect();

        let outcomes = match tokio::time::timeout(
            self.timeout,
            self.api.submit_batch(&batch_id, &batch, &params),
        )
        .await
        {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(e)) => {
                warn!("Batch {}: submission transport failure: {}", batch_id, e);
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "Batch {}: submission timed out after {}s, records left Pending",
                    batch_id,
                    self.timeout.as_secs()
                );
                return Err(ClientError::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        for outcome in outcomes {
            self.apply_outcome(&batch_id, outcome)?;
        }
        Ok(local_ids)
    }

    /// Resubmit a single existing record (explicit user retry). The record
    /// keeps its local id; a fresh single-file batch carries it.
    pub async fn resubmit(&self, record: &TaskRecord) -> Result<()> {
        let batch_id = record
            .batch_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let file = FileSpec {
            path: record.source_path.clone(),
            display_name: record.display_name.clone(),
            bytes: record.source_bytes,
        };
        let batch = vec![(record.local_id.clone(), file)];

        let outcomes = tokio::time::timeout(
            self.timeout,
            self.api.submit_batch(&batch_id, &batch, &record.params),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            seconds: self.timeout.as_secs(),
        })??;

        for outcome in outcomes {
            self.apply_outcome(&batch_id, outcome)?;
        }
        Ok(())
    }

    fn apply_outcome(&self, batch_id: &str, outcome: SubmissionOutcome) -> Result<()> {
        match outcome.result {
            Ok(server_task_id) => {
                // Rewrite-after-confirm: push events for the server id are
                // only resolvable once this mapping is persisted.
                self.store.update_identifier_mapping(
                    &outcome.local_id,
                    &server_task_id,
                    Some(batch_id),
                )?;
                info!(
                    "Task {}: confirmed by server as {}",
                    outcome.local_id, server_task_id
                );
            }
            Err(message) => {
                // The record stays keyed by its local id.
                self.store
                    .update_status(&outcome.local_id, TaskStatus::Failed, Some(&message))?;
                warn!("Task {}: rejected by server: {}", outcome.local_id, message);
            }
        }
        Ok(())
    }

    /// Cancel a task: applied locally first (optimistic), then forwarded to
    /// the remote service. The next authoritative fetch corrects the local
    /// status if the service rejects the cancellation.
    pub async fn cancel(&self, current_task_id: &str) -> Result<()> {
        self.store
            .update_status(current_task_id, TaskStatus::Cancelled, None)?;
        info!("Task {}: cancelled locally, forwarding to server", current_task_id);
        self.api.cancel(current_task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory submission service: scripted per-display-name outcomes.
    struct FakeApi {
        rejects: Vec<&'static str>,
        cancelled: Mutex<Vec<String>>,
        hang: bool,
    }

    #[async_trait]
    impl SubmissionApi for FakeApi {
        async fn submit_batch(
            &self,
            _batch_id: &str,
            files: &[(String, FileSpec)],
            _params: &serde_json::Value,
        ) -> Result<Vec<SubmissionOutcome>> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(files
                .iter()
                .enumerate()
                .map(|(i, (local_id, file))| SubmissionOutcome {
                    local_id: local_id.clone(),
                    result: if self.rejects.contains(&file.display_name.as_str()) {
                        Err("unsupported container".to_string())
                    } else {
                        Ok(format!("srv-{}", i))
                    },
                })
                .collect())
        }

        async fn cancel(&self, task_id: &str) -> Result<()> {
            self.cancelled.lock().unwrap().push(task_id.to_string());
            Ok(())
        }
    }

    fn files(names: &[&str]) -> Vec<FileSpec> {
        names
            .iter()
            .map(|n| FileSpec {
                path: PathBuf::from(format!("/media/{}", n)),
                display_name: n.to_string(),
                bytes: 1_000_000,
            })
            .collect()
    }

    fn manager(dir: &TempDir, api: FakeApi, timeout: Duration) -> (SubmissionManager, Arc<TaskStore>) {
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let mgr = SubmissionManager::new(Arc::clone(&store), Arc::new(api), timeout, 3);
        (mgr, store)
    }

    #[tokio::test]
    async fn partial_batch_confirmation() {
        let dir = TempDir::new().unwrap();
        let api = FakeApi {
            rejects: vec!["two.mkv"],
            cancelled: Mutex::new(Vec::new()),
            hang: false,
        };
        let (mgr, store) = manager(&dir, api, Duration::from_secs(5));

        let ids = mgr
            .submit(files(&["one.mkv", "two.mkv", "three.mkv"]), serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let by_name: HashMap<String, TaskRecord> = store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|r| (r.display_name.clone(), r))
            .collect();

        // Confirmed files are re-keyed to the server id.
        for name in ["one.mkv", "three.mkv"] {
            let rec = &by_name[name];
            assert_ne!(rec.current_task_id, rec.local_id);
            assert_eq!(rec.server_task_id.as_deref(), Some(rec.current_task_id.as_str()));
            assert_eq!(rec.status, TaskStatus::Pending);
        }
        // The rejected file keeps its local key and is Failed.
        let rejected = &by_name["two.mkv"];
        assert_eq!(rejected.current_task_id, rejected.local_id);
        assert_eq!(rejected.status, TaskStatus::Failed);
        assert_eq!(rejected.last_error.as_deref(), Some("unsupported container"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_records_pending() {
        let dir = TempDir::new().unwrap();
        let api = FakeApi {
            rejects: vec![],
            cancelled: Mutex::new(Vec::new()),
            hang: true,
        };
        let (mgr, store) = manager(&dir, api, Duration::from_secs(2));

        let err = mgr
            .submit(files(&["slow.mkv"]), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));

        let recs = store.list_all().unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].status, TaskStatus::Pending);
        assert_eq!(recs[0].current_task_id, recs[0].local_id);
    }

    #[tokio::test]
    async fn cancel_is_optimistic_then_forwarded() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi {
            rejects: vec![],
            cancelled: Mutex::new(Vec::new()),
            hang: false,
        });
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let mgr = SubmissionManager::new(
            Arc::clone(&store),
            Arc::clone(&api) as Arc<dyn SubmissionApi>,
            Duration::from_secs(5),
            3,
        );

        let ids = mgr
            .submit(files(&["x.mkv"]), serde_json::Value::Null)
            .await
            .unwrap();
        let rec = store.get(&ids[0]).unwrap();

        mgr.cancel(&rec.current_task_id).await.unwrap();
        let rec = store.get(&ids[0]).unwrap();
        assert_eq!(rec.status, TaskStatus::Cancelled);
        assert_eq!(
            api.cancelled.lock().unwrap().as_slice(),
            &[rec.current_task_id.clone()]
        );
    }
}
