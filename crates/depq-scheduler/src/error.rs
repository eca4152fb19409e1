//! Queue error types.

use depq_core::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Core(#[from] depq_core::Error),

    #[error(transparent)]
    Db(#[from] depq_db::DbError),

    /// This process no longer owns the job; another worker may have stolen it.
    #[error("lease on job '{0}' was lost")]
    LeaseLost(JobId),

    #[error("no handler registered for job type '{0}'")]
    UnknownJobType(String),

    #[error("handler already registered for job type '{0}'")]
    DuplicateHandler(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
