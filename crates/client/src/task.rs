use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a conversion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Uploading,
    Converting,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are sticky: no progress transition is accepted once
    /// a task reaches one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Default phase tag for a status, used when a transition is driven by
    /// the authoritative remote list rather than a progress event.
    pub fn phase_tag(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Converting => "converting",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// The locally-owned record for one submitted file.
///
/// `local_id` is generated at creation and never changes. `current_task_id`
/// starts equal to `local_id` and is rewritten to the server-issued
/// identifier once the submission is confirmed; it is the only valid key
/// for correlating inbound progress events at any point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub local_id: String,
    pub current_task_id: String,
    pub server_task_id: Option<String>,
    pub batch_id: Option<String>,

    pub source_path: PathBuf,
    pub display_name: String,
    pub source_bytes: u64,
    /// Opaque conversion parameter snapshot; not interpreted by the core.
    pub params: serde_json::Value,

    pub status: TaskStatus,
    /// Free-form sub-state tag ("pending", "uploading", "upload_completed",
    /// "converting", ...).
    pub phase: String,
    pub progress: u8,

    pub created_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,

    pub is_downloaded: bool,
    pub local_output_path: Option<PathBuf>,

    pub source_file_processed: bool,
    pub source_file_action: Option<String>,
    pub archive_path: Option<PathBuf>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn new(
        source_path: PathBuf,
        display_name: String,
        source_bytes: u64,
        params: serde_json::Value,
        max_retries: u32,
    ) -> Self {
        let local_id = Uuid::new_v4().to_string();
        Self {
            current_task_id: local_id.clone(),
            local_id,
            server_task_id: None,
            batch_id: None,
            source_path,
            display_name,
            source_bytes,
            params,
            status: TaskStatus::Pending,
            phase: "pending".to_string(),
            progress: 0,
            created_at: Utc::now(),
            downloaded_at: None,
            is_downloaded: false,
            local_output_path: None,
            source_file_processed: false,
            source_file_action: None,
            archive_path: None,
            retry_count: 0,
            max_retries,
            last_error: None,
        }
    }
}

/// A task as reported by the remote authoritative list. Never persisted
/// verbatim; only used as merge input for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTask {
    pub id: String,
    pub display_name: String,
    pub original_filename: String,
    pub original_bytes: u64,
    pub status: String,
    pub progress: u8,
    pub created_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_url: Option<String>,
    pub output_bytes: Option<u64>,
    pub error_message: Option<String>,
}

impl RemoteTask {
    /// Map the server's status string onto the local status enum.
    /// Unknown strings yield `None`; callers keep the local status then.
    pub fn parse_status(&self) -> Option<TaskStatus> {
        match self.status.to_ascii_lowercase().as_str() {
            "pending" | "queued" => Some(TaskStatus::Pending),
            "uploading" => Some(TaskStatus::Uploading),
            "converting" | "processing" | "running" => Some(TaskStatus::Converting),
            "completed" | "success" => Some(TaskStatus::Completed),
            "failed" | "error" => Some(TaskStatus::Failed),
            "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// Union of a remote task's authoritative fields with a matched local
/// record's local-only fields. Built fresh on every reconciliation pass
/// and never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledTask {
    pub remote_id: Option<String>,
    pub local_id: Option<String>,
    pub display_name: String,
    pub original_filename: Option<String>,
    pub source_bytes: u64,
    pub status: TaskStatus,
    pub progress: u8,
    pub created_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_url: Option<String>,
    pub error_message: Option<String>,

    pub batch_id: Option<String>,
    pub is_downloaded: bool,
    pub local_output_path: Option<PathBuf>,
    pub retry_count: u32,
    pub local_error: Option<String>,
}

impl ReconciledTask {
    /// View for a remote task with no matching local record. Local-only
    /// fields default to unknown / not downloaded.
    pub fn from_remote(remote: &RemoteTask) -> Self {
        Self {
            remote_id: Some(remote.id.clone()),
            local_id: None,
            display_name: remote.display_name.clone(),
            original_filename: Some(remote.original_filename.clone()),
            source_bytes: remote.original_bytes,
            status: remote.parse_status().unwrap_or(TaskStatus::Pending),
            progress: remote.progress.min(100),
            created_at: remote.created_at,
            finished_at: remote.finished_at,
            output_url: remote.output_url.clone(),
            error_message: remote.error_message.clone(),
            batch_id: None,
            is_downloaded: false,
            local_output_path: None,
            retry_count: 0,
            local_error: None,
        }
    }

    /// View for an orphaned local record no remote task references.
    pub fn from_local(local: &TaskRecord) -> Self {
        Self {
            remote_id: local.server_task_id.clone(),
            local_id: Some(local.local_id.clone()),
            display_name: local.display_name.clone(),
            original_filename: None,
            source_bytes: local.source_bytes,
            status: local.status,
            progress: local.progress,
            created_at: Some(local.created_at),
            finished_at: None,
            output_url: None,
            error_message: None,
            batch_id: local.batch_id.clone(),
            is_downloaded: local.is_downloaded,
            local_output_path: local.local_output_path.clone(),
            retry_count: local.retry_count,
            local_error: local.last_error.clone(),
        }
    }

    /// Merge: remote fields are authoritative, local-only bookkeeping comes
    /// from the matched record.
    pub fn merge(remote: &RemoteTask, local: &TaskRecord) -> Self {
        Self {
            remote_id: Some(remote.id.clone()),
            local_id: Some(local.local_id.clone()),
            display_name: remote.display_name.clone(),
            original_filename: Some(remote.original_filename.clone()),
            source_bytes: remote.original_bytes,
            status: remote.parse_status().unwrap_or(local.status),
            progress: remote.progress.min(100),
            created_at: remote.created_at.or(Some(local.created_at)),
            finished_at: remote.finished_at,
            output_url: remote.output_url.clone(),
            error_message: remote.error_message.clone(),
            batch_id: local.batch_id.clone(),
            is_downloaded: local.is_downloaded,
            local_output_path: local.local_output_path.clone(),
            retry_count: local.retry_count,
            local_error: local.last_error.clone(),
        }
    }
}
