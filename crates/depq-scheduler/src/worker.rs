//! Worker pool that pulls jobs from a [`Queue`] and runs their handlers.

use depq_config::QueueConfig;
use depq_core::Job;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{HandlerRegistry, Queue};

/// A fixed number of workers sharing one queue and one shutdown token.
pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    handlers: Arc<HandlerRegistry>,
    size: usize,
    heartbeat_interval: Duration,
    max_attempts: u32,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn Queue>, handlers: Arc<HandlerRegistry>, config: &QueueConfig) -> Self {
        Self {
            queue,
            handlers,
            size: config.workers.max(1),
            heartbeat_interval: (config.lock_timeout / 3).max(Duration::from_millis(10)),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Start the workers. They stop taking new jobs once `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> PoolHandle {
        let joins = (0..self.size)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    queue: Arc::clone(&self.queue),
                    handlers: Arc::clone(&self.handlers),
                    heartbeat_interval: self.heartbeat_interval,
                    max_attempts: self.max_attempts,
                };
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(cancel).await })
            })
            .collect();

        PoolHandle { cancel, joins }
    }
}

/// Handle to a running pool.
pub struct PoolHandle {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Stop taking new jobs. Jobs already running finish normally.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "worker task panicked");
            }
        }
    }

    pub async fn shutdown_and_join(self) {
        self.shutdown();
        self.join().await;
    }
}

struct Worker {
    id: usize,
    queue: Arc<dyn Queue>,
    handlers: Arc<HandlerRegistry>,
    heartbeat_interval: Duration,
    max_attempts: u32,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        info!(worker_id = self.id, "Starting worker");

        loop {
            let job = match self.queue.next(&cancel).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = self.id, error = %e, "Failed to fetch next job");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            self.execute(job).await;
        }

        info!(worker_id = self.id, "Worker stopped");
    }

    /// Run one job, heartbeating until its handler returns.
    async fn execute(&self, job: Job) {
        info!(worker_id = self.id, job_id = %job.id, job_type = %job.job_type, "Running job");

        let result = {
            let handle = self.handlers.execute(&job);
            tokio::pin!(handle);
            let mut ticker = tokio::time::interval(self.heartbeat_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    result = &mut handle => break result,
                    _ = ticker.tick() => {
                        if let Err(e) = self.queue.heartbeat(&job).await {
                            warn!(job_id = %job.id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&job).await {
                    warn!(job_id = %job.id, error = %e, "Failed to mark job complete");
                }
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "Job failed");
                self.handle_failure(&job, &err.to_string()).await;
            }
        }
    }

    async fn handle_failure(&self, job: &Job, message: &str) {
        let failed = match self.queue.fail(job, message).await {
            Ok(failed) => failed,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to record job error");
                return;
            }
        };

        let attempts = u32::try_from(failed.status.err_count).unwrap_or(u32::MAX);
        let outcome = if attempts < self.max_attempts {
            self.queue.release(&failed).await
        } else {
            warn!(job_id = %job.id, attempts, "Giving up on job");
            self.queue.complete(&failed).await
        };
        if let Err(e) = outcome {
            warn!(job_id = %job.id, error = %e, "Failed to report job failure");
        }
    }
}
