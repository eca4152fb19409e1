//! The contract between queues and the worker pool.

use async_trait::async_trait;
use depq_core::{Job, QueueStats};
use tokio_util::sync::CancellationToken;

use crate::QueueResult;

/// A source of dispatchable jobs.
///
/// `next` hands a job to this queue's owner; the caller must then report it
/// back through `complete`, or `fail` followed by `release` or `complete`.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Submit a job. A repeated id is a `DuplicateJob` error.
    async fn put(&self, job: Job) -> QueueResult<()>;
    async fn get(&self, id: &str) -> QueueResult<Option<Job>>;
    /// Wait for the next dispatchable job. Returns `None` once `cancel` fires.
    async fn next(&self, cancel: &CancellationToken) -> QueueResult<Option<Job>>;
    /// Mark a dispatched job completed and release its scopes.
    async fn complete(&self, job: &Job) -> QueueResult<()>;
    /// Record an execution failure; returns the updated job.
    async fn fail(&self, job: &Job, message: &str) -> QueueResult<Job>;
    /// Return a dispatched job so it can be dispatched again.
    async fn release(&self, job: &Job) -> QueueResult<()>;
    /// Keep a dispatched job's lease alive.
    async fn heartbeat(&self, job: &Job) -> QueueResult<()>;
    async fn delete(&self, id: &str) -> QueueResult<usize>;
    async fn stats(&self) -> QueueResult<QueueStats>;
}
