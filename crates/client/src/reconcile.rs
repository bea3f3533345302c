use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{ReconciledTask, RemoteTask, TaskRecord, TaskStatus};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Pagination guard; the authoritative list is bounded in practice, this
/// only protects against a server that keeps claiming more pages.
const MAX_PAGES: u32 = 512;

/// One page of the remote authoritative task list.
#[derive(Debug, Clone)]
pub struct RemotePage {
    pub tasks: Vec<RemoteTask>,
    pub has_more: bool,
}

/// Remote task-list boundary.
#[async_trait]
pub trait RemoteListApi: Send + Sync {
    async fn fetch_tasks(&self, page: u32) -> Result<RemotePage>;
}

/// How a remote task was paired with a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ServerId,
    CurrentId,
    Fuzzy,
}

/// One remote task's reconciled view plus the match that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMatch {
    pub view: ReconciledTask,
    pub local_id: Option<String>,
    pub matched_by: Option<MatchKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub matches: Vec<TaskMatch>,
    /// Local records no remote task references, reported rather than
    /// silently dropped (consumed by deletion flows and the integrity
    /// checker).
    pub orphans: Vec<String>,
}

/// Pure matching policy: pair each remote task with at most one local
/// record using a strict priority order, stopping at the first hit.
///
/// 1. exact match on `server_task_id`
/// 2. exact match on `current_task_id`
/// 3. fuzzy: same filename and byte-size delta below `size_tolerance`,
///    recovering records whose identifier mapping was lost.
///
/// Deterministic: the same two input lists always produce the same
/// pairing. Fuzzy ambiguity is resolved by earliest `created_at` (then
/// `local_id`) and logged as a warning, never an error.
pub fn match_tasks(
    remote: &[RemoteTask],
    local: &[TaskRecord],
    size_tolerance: u64,
) -> MatchOutcome {
    let by_server: HashMap<&str, usize> = local
        .iter()
        .enumerate()
        .filter_map(|(i, rec)| rec.server_task_id.as_deref().map(|id| (id, i)))
        .collect();
    let by_current: HashMap<&str, usize> = local
        .iter()
        .enumerate()
        .map(|(i, rec)| (rec.current_task_id.as_str(), i))
        .collect();

    let mut used: HashSet<usize> = HashSet::new();
    let mut matches = Vec::with_capacity(remote.len());

    for task in remote {
        let hit = by_server
            .get(task.id.as_str())
            .copied()
            .filter(|i| !used.contains(i))
            .map(|i| (i, MatchKind::ServerId))
            .or_else(|| {
                by_current
                    .get(task.id.as_str())
                    .copied()
                    .filter(|i| !used.contains(i))
                    .map(|i| (i, MatchKind::CurrentId))
            })
            .or_else(|| fuzzy_match(task, local, &used, size_tolerance));

        match hit {
            Some((i, kind)) => {
                used.insert(i);
                matches.push(TaskMatch {
                    view: ReconciledTask::merge(task, &local[i]),
                    local_id: Some(local[i].local_id.clone()),
                    matched_by: Some(kind),
                });
            }
            None => {
                matches.push(TaskMatch {
                    view: ReconciledTask::from_remote(task),
                    local_id: None,
                    matched_by: None,
                });
            }
        }
    }

    let orphans = local
        .iter()
        .enumerate()
        .filter(|(i, _)| !used.contains(i))
        .map(|(_, rec)| rec.local_id.clone())
        .collect();

    MatchOutcome { matches, orphans }
}

fn fuzzy_match(
    task: &RemoteTask,
    local: &[TaskRecord],
    used: &HashSet<usize>,
    size_tolerance: u64,
) -> Option<(usize, MatchKind)> {
    let mut candidates: Vec<usize> = local
        .iter()
        .enumerate()
        .filter(|(i, rec)| {
            !used.contains(i)
                && rec.display_name == task.original_filename
                && rec.source_bytes.abs_diff(task.original_bytes) < size_tolerance
        })
        .map(|(i, _)| i)
        .collect();

    if candidates.is_empty() {
        return None;
    }
    if candidates.len() > 1 {
        warn!(
            "Remote task {}: {} equally-good fuzzy candidates for '{}', picking earliest created",
            task.id,
            candidates.len(),
            task.original_filename
        );
    }
    candidates.sort_by(|&a, &b| {
        local[a]
            .created_at
            .cmp(&local[b].created_at)
            .then_with(|| local[a].local_id.cmp(&local[b].local_id))
    });
    Some((candidates[0], MatchKind::Fuzzy))
}

/// Fetches the authoritative remote list, merges it against the store and
/// repairs identifier and status drift.
pub struct ReconcileEngine {
    store: Arc<TaskStore>,
    api: Arc<dyn RemoteListApi>,
    size_tolerance: u64,
}

impl ReconcileEngine {
    pub fn new(store: Arc<TaskStore>, api: Arc<dyn RemoteListApi>, size_tolerance: u64) -> Self {
        Self {
            store,
            api,
            size_tolerance,
        }
    }

    async fn fetch_all(&self) -> Result<Vec<RemoteTask>> {
        let mut tasks = Vec::new();
        let mut page = 0;
        loop {
            let batch = self.api.fetch_tasks(page).await?;
            tasks.extend(batch.tasks);
            if !batch.has_more {
                break;
            }
            page += 1;
            if page >= MAX_PAGES {
                warn!("Remote task list exceeded {} pages, truncating fetch", MAX_PAGES);
                break;
            }
        }
        Ok(tasks)
    }

    /// Run one full reconciliation pass. Idempotent: unchanged inputs
    /// produce structurally equal output and no further store writes.
    pub async fn reconcile_now(&self) -> Result<MatchOutcome> {
        let remote = self.fetch_all().await?;

        // Stable local ordering so fuzzy ties resolve the same way on
        // every pass regardless of directory iteration order.
        let mut locals = self.store.list_all()?;
        locals.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.local_id.cmp(&b.local_id))
        });

        let outcome = match_tasks(&remote, &locals, self.size_tolerance);
        debug!(
            "reconcile: {} remote, {} local, {} orphans",
            remote.len(),
            locals.len(),
            outcome.orphans.len()
        );

        for m in &outcome.matches {
            let (Some(local_id), Some(remote_id)) = (&m.local_id, &m.view.remote_id) else {
                continue;
            };
            if let Err(e) = self.repair(local_id, remote_id, m) {
                warn!("Task {}: reconciliation repair failed: {}", local_id, e);
            }
        }

        Ok(outcome)
    }

    fn repair(&self, local_id: &str, remote_id: &str, m: &TaskMatch) -> Result<()> {
        let record = self.store.get(local_id)?;

        // Identifier drift: a fuzzy hit (or a lost rewrite) means the
        // record is not keyed by the id the server uses. Re-point it.
        if record.current_task_id != remote_id {
            info!(
                "Task {}: repairing identifier drift {} -> {}",
                local_id, record.current_task_id, remote_id
            );
            self.store
                .update_identifier_mapping(local_id, remote_id, record.batch_id.as_deref())?;
        }

        let remote_status = m.view.status;
        let record = self.store.get(local_id)?;

        if remote_status.is_terminal() {
            // The remote outcome is authoritative once the task is done.
            if record.status != remote_status {
                self.store.update_status(
                    remote_id,
                    remote_status,
                    m.view.error_message.as_deref(),
                )?;
            }
        } else if record.status == TaskStatus::Cancelled {
            // Optimistic local cancellation that the service rejected:
            // fall back to what the server says the task is doing.
            info!(
                "Task {}: cancellation rejected by server, restoring status {:?}",
                local_id, remote_status
            );
            self.store.update_progress_state(
                remote_id,
                remote_status,
                remote_status.phase_tag(),
                m.view.progress,
            )?;
        }
        Ok(())
    }
}
