use thiserror::Error;
use uuid::Uuid;

use super::store::StoreError;

/// Errors surfaced by the scheduler's management API.
///
/// Failures inside a job body never appear here; they are logged and
/// recorded in run history.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("failed to load scheduled jobs: {0}")]
    FailedToLoadJobs(#[source] StoreError),

    #[error("job store operation failed: {0}")]
    PersistenceFailed(#[source] StoreError),
}
