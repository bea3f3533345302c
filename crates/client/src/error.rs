use thiserror::Error;

/// Errors produced by the client core.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An update call referenced an identifier the store does not know.
    /// Update paths treat this as a logged no-op rather than creating a
    /// record; silent creation would corrupt reconciliation.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// The remote service rejected a file in a submission batch.
    #[error("submission rejected: {message}")]
    Submission { message: String },

    /// Network-level failure talking to the remote service. The caller
    /// retries by re-invoking; submission and reconciliation are safe to
    /// re-enter.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// A caller-bounded remote call exceeded its deadline.
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// A task exhausted its manual retry budget and stays Failed.
    #[error("retries exhausted for task {task_id} (max {max_retries})")]
    RetriesExhausted { task_id: String, max_retries: u32 },

    #[error("task state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
