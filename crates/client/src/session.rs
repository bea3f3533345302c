use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::integrity::{IntegrityChecker, SweepReport};
use crate::progress::{ProgressManager, ProgressNotice, SubscriptionId};
use crate::reconcile::{MatchOutcome, ReconcileEngine, RemoteListApi};
use crate::store::TaskStore;
use crate::submit::{FileSpec, SubmissionApi, SubmissionManager};
use crate::task::ReconciledTask;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Event delivered by the push channel, keyed by `current_task_id`.
#[derive(Debug, Clone)]
pub enum PushEvent {
    Progress {
        task_id: String,
        percent: u32,
        speed_bps: Option<f64>,
        eta_secs: Option<u64>,
    },
    Completed {
        task_id: String,
        success: bool,
        message: Option<String>,
    },
}

/// Application-session root wiring the store, submission manager,
/// reconciliation engine, progress manager and integrity checker.
/// Constructed once and passed by reference to collaborators; no global
/// singletons.
pub struct ClientSession {
    store: Arc<TaskStore>,
    submission: SubmissionManager,
    reconciler: ReconcileEngine,
    progress: Arc<ProgressManager>,
    integrity: Arc<IntegrityChecker>,
}

impl ClientSession {
    pub fn new(
        config: &ClientConfig,
        submission_api: Arc<dyn SubmissionApi>,
        list_api: Arc<dyn RemoteListApi>,
    ) -> Result<Self> {
        let store = Arc::new(TaskStore::open(&config.task_state_dir)?);
        let submission = SubmissionManager::new(
            Arc::clone(&store),
            submission_api,
            Duration::from_secs(config.request_timeout_secs),
            config.default_max_retries,
        );
        let reconciler = ReconcileEngine::new(
            Arc::clone(&store),
            list_api,
            config.fuzzy_size_tolerance,
        );
        let progress = Arc::new(ProgressManager::new(Arc::clone(&store)));
        let integrity = Arc::new(IntegrityChecker::new(Arc::clone(&store)));
        Ok(Self {
            store,
            submission,
            reconciler,
            progress,
            integrity,
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn progress(&self) -> &Arc<ProgressManager> {
        &self.progress
    }

    /// Submit files as one conversion batch; returns the local ids.
    pub async fn submit(
        &self,
        files: Vec<FileSpec>,
        params: serde_json::Value,
    ) -> Result<Vec<String>> {
        self.submission.submit(files, params).await
    }

    /// Cancel a task (optimistic locally, forwarded to the service).
    pub async fn cancel(&self, current_task_id: &str) -> Result<()> {
        self.submission.cancel(current_task_id).await
    }

    /// Explicit user retry for a Failed task, bounded by its retry budget.
    pub async fn retry(&self, current_task_id: &str) -> Result<()> {
        let record = self.store.mark_retry(current_task_id)?;
        info!(
            "Task {}: manual retry {}/{}",
            record.local_id, record.retry_count, record.max_retries
        );
        self.submission.resubmit(&record).await
    }

    /// Remove a task record. Non-terminal tasks are cancelled remotely on
    /// a best-effort basis first.
    pub async fn delete(&self, local_id: &str) -> Result<()> {
        let record = self.store.get(local_id)?;
        if !record.status.is_terminal() {
            if let Err(e) = self.submission.cancel(&record.current_task_id).await {
                warn!(
                    "Task {}: cancel before delete failed ({}), removing anyway",
                    local_id, e
                );
            }
        }
        self.store.remove(local_id)
    }

    /// Full reconciliation pass, followed by an opportunistic integrity
    /// sweep over the refreshed store.
    pub async fn reconcile_now(&self) -> Result<MatchOutcome> {
        let outcome = self.reconciler.reconcile_now().await?;
        match self.integrity.sweep() {
            Ok(Some(SweepReport { checked, missing })) if missing > 0 => {
                info!("Post-reconcile sweep: {} checked, {} missing", checked, missing)
            }
            Ok(_) => {}
            Err(e) => warn!("Post-reconcile integrity sweep failed: {}", e),
        }
        Ok(outcome)
    }

    /// One coherent view over everything known: reconciled views for the
    /// remote list plus local-only views for orphaned records. Falls back
    /// to store contents when the service is unreachable.
    pub async fn list_all(&self) -> Result<Vec<ReconciledTask>> {
        match self.reconcile_now().await {
            Ok(outcome) => {
                let mut views: Vec<ReconciledTask> =
                    outcome.matches.into_iter().map(|m| m.view).collect();
                for local_id in &outcome.orphans {
                    match self.store.get(local_id) {
                        Ok(record) => views.push(ReconciledTask::from_local(&record)),
                        Err(e) => warn!("Orphan {} vanished during listing: {}", local_id, e),
                    }
                }
                Ok(views)
            }
            Err(e @ (ClientError::Transport { .. } | ClientError::Timeout { .. })) => {
                warn!("Reconcile unavailable ({}), listing local records only", e);
                let mut records = self.store.list_all()?;
                records.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.local_id.cmp(&b.local_id))
                });
                Ok(records.iter().map(ReconciledTask::from_local).collect())
            }
            Err(e) => Err(e),
        }
    }

    /// Trigger an integrity sweep directly.
    pub fn sweep(&self) -> Result<Option<SweepReport>> {
        self.integrity.sweep()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&ProgressNotice) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.progress.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.progress.unsubscribe(id)
    }

    /// Pump push-channel events into the progress manager. The receiver is
    /// drained until the sender side closes.
    pub fn attach_push_events(
        &self,
        mut events: mpsc::Receiver<PushEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let progress = Arc::clone(&self.progress);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let applied = match event {
                    PushEvent::Progress {
                        task_id,
                        percent,
                        speed_bps,
                        eta_secs,
                    } => progress.update_progress(
                        &task_id,
                        percent,
                        "converting",
                        speed_bps,
                        eta_secs,
                        None,
                    ),
                    PushEvent::Completed {
                        task_id,
                        success,
                        message,
                    } => progress.on_task_completed(&task_id, success, message.as_deref()),
                };
                if let Err(e) = applied {
                    warn!("Push event could not be applied: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::RemotePage;
    use crate::submit::SubmissionOutcome;
    use crate::task::{RemoteTask, TaskStatus};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct AcceptAll;

    #[async_trait]
    impl SubmissionApi for AcceptAll {
        async fn submit_batch(
            &self,
            _batch_id: &str,
            files: &[(String, FileSpec)],
            _params: &serde_json::Value,
        ) -> Result<Vec<SubmissionOutcome>> {
            Ok(files
                .iter()
                .map(|(local_id, file)| SubmissionOutcome {
                    local_id: local_id.clone(),
                    result: Ok(format!("srv-{}", file.display_name)),
                })
                .collect())
        }

        async fn cancel(&self, _task_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl RemoteListApi for Unreachable {
        async fn fetch_tasks(&self, _page: u32) -> Result<RemotePage> {
            Err(ClientError::Transport {
                message: "connection refused".to_string(),
            })
        }
    }

    struct Echo;

    #[async_trait]
    impl RemoteListApi for Echo {
        async fn fetch_tasks(&self, _page: u32) -> Result<RemotePage> {
            Ok(RemotePage {
                tasks: vec![RemoteTask {
                    id: "srv-a.mkv".to_string(),
                    display_name: "a.mkv".to_string(),
                    original_filename: "a.mkv".to_string(),
                    original_bytes: 1_000,
                    status: "converting".to_string(),
                    progress: 50,
                    created_at: None,
                    finished_at: None,
                    output_url: None,
                    output_bytes: None,
                    error_message: None,
                }],
                has_more: false,
            })
        }
    }

    fn config(dir: &TempDir) -> ClientConfig {
        let mut cfg = ClientConfig::default_config();
        cfg.task_state_dir = dir.path().to_path_buf();
        cfg
    }

    fn file(name: &str) -> FileSpec {
        FileSpec {
            path: PathBuf::from(format!("/media/{}", name)),
            display_name: name.to_string(),
            bytes: 1_000,
        }
    }

    #[tokio::test]
    async fn submit_then_push_events_flow_through() {
        let dir = TempDir::new().unwrap();
        let session =
            ClientSession::new(&config(&dir), Arc::new(AcceptAll), Arc::new(Echo)).unwrap();

        let ids = session
            .submit(vec![file("a.mkv")], serde_json::Value::Null)
            .await
            .unwrap();
        let rec = session.store().get(&ids[0]).unwrap();
        assert_eq!(rec.current_task_id, "srv-a.mkv");

        let (tx, rx) = mpsc::channel(8);
        let pump = session.attach_push_events(rx);
        tx.send(PushEvent::Progress {
            task_id: "srv-a.mkv".to_string(),
            percent: 42,
            speed_bps: None,
            eta_secs: None,
        })
        .await
        .unwrap();
        tx.send(PushEvent::Completed {
            task_id: "srv-a.mkv".to_string(),
            success: true,
            message: None,
        })
        .await
        .unwrap();
        drop(tx);
        pump.await.unwrap();

        let rec = session.store().get(&ids[0]).unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.progress, 100);
    }

    #[tokio::test]
    async fn list_all_falls_back_to_local_when_offline() {
        let dir = TempDir::new().unwrap();
        let session =
            ClientSession::new(&config(&dir), Arc::new(AcceptAll), Arc::new(Unreachable))
                .unwrap();

        session
            .submit(vec![file("b.mkv")], serde_json::Value::Null)
            .await
            .unwrap();

        let views = session.list_all().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].display_name, "b.mkv");
        assert!(views[0].local_id.is_some());
    }

    #[tokio::test]
    async fn list_all_includes_orphans() {
        let dir = TempDir::new().unwrap();
        let session =
            ClientSession::new(&config(&dir), Arc::new(AcceptAll), Arc::new(Echo)).unwrap();

        // One task the remote knows about, one it does not.
        session
            .submit(vec![file("a.mkv")], serde_json::Value::Null)
            .await
            .unwrap();
        session
            .submit(vec![file("orphan.mkv")], serde_json::Value::Null)
            .await
            .unwrap();

        let views = session.list_all().await.unwrap();
        assert_eq!(views.len(), 2);
        assert!(views.iter().any(|v| v.display_name == "a.mkv" && v.remote_id.is_some()));
        assert!(views.iter().any(|v| v.display_name == "orphan.mkv"));
    }
}
