//! Error types for depq.

use thiserror::Error;

use crate::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot add duplicate job with id '{0}'")]
    DuplicateJob(JobId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
