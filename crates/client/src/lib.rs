pub mod config;
pub mod error;
pub mod integrity;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod submit;
pub mod task;

pub use config::ClientConfig;
pub use error::ClientError;
pub use integrity::{IntegrityChecker, SweepReport};
pub use progress::{ProgressManager, ProgressNotice, SubscriptionId};
pub use reconcile::{MatchOutcome, ReconcileEngine, RemoteListApi, RemotePage};
pub use session::{ClientSession, PushEvent};
pub use store::TaskStore;
pub use submit::{FileSpec, SubmissionApi, SubmissionManager, SubmissionOutcome};
pub use task::{ReconciledTask, RemoteTask, TaskRecord, TaskStatus};
