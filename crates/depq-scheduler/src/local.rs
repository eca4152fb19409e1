//! In-process queue ordered by [`AdaptiveOrder`].

use async_trait::async_trait;
use depq_core::{AdaptiveOrder, DependencyResolver, Job, QueueStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Queue, QueueResult};

/// Queue whose jobs live in this process only.
///
/// Every operation takes the one lock around the classifier, so the
/// classifier never observes concurrent mutation.
pub struct LocalOrderedQueue {
    order: Mutex<AdaptiveOrder>,
    notify: Notify,
    owner: String,
    poll_interval: Duration,
}

impl LocalOrderedQueue {
    pub fn new(poll_interval: Duration) -> Self {
        Self::from_order(AdaptiveOrder::new(), poll_interval)
    }

    pub fn with_resolver(resolver: Arc<dyn DependencyResolver>, poll_interval: Duration) -> Self {
        Self::from_order(AdaptiveOrder::with_resolver(resolver), poll_interval)
    }

    fn from_order(order: AdaptiveOrder, poll_interval: Duration) -> Self {
        Self {
            order: Mutex::new(order),
            notify: Notify::new(),
            owner: format!("local-{}", uuid::Uuid::now_v7()),
            poll_interval,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Re-filter, then pop the head of `ready`.
    ///
    /// A cancelled re-filter leaves the buckets as they were, so the pop
    /// still sees a consistent `ready`.
    async fn try_dispatch(&self, cancel: &CancellationToken) -> Option<Job> {
        let mut order = self.order.lock().await;
        order.refilter(cancel);
        order.pop_ready(&self.owner)
    }
}

#[async_trait]
impl Queue for LocalOrderedQueue {
    async fn put(&self, job: Job) -> QueueResult<()> {
        let id = job.id.clone();
        let bucket = self.order.lock().await.add(job)?;
        debug!(job_id = %id, ?bucket, "queued job");
        self.notify.notify_one();
        Ok(())
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        Ok(self.order.lock().await.get(id).cloned())
    }

    async fn next(&self, cancel: &CancellationToken) -> QueueResult<Option<Job>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.try_dispatch(cancel).await {
                debug!(job_id = %job.id, "dispatched job");
                return Ok(Some(job));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        self.order.lock().await.complete(job.id.as_str())?;
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, job: &Job, message: &str) -> QueueResult<Job> {
        Ok(self.order.lock().await.record_error(job.id.as_str(), message)?)
    }

    async fn release(&self, job: &Job) -> QueueResult<()> {
        self.order.lock().await.release(job.id.as_str())?;
        self.notify.notify_one();
        Ok(())
    }

    async fn heartbeat(&self, job: &Job) -> QueueResult<()> {
        // Nothing can steal a job from this process.
        let order = self.order.lock().await;
        if order.get(job.id.as_str()).is_none() {
            return Err(depq_core::Error::NotFound(format!("job {}", job.id)).into());
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> QueueResult<usize> {
        let removed = self
            .order
            .lock()
            .await
            .delete(id, &CancellationToken::new());
        Ok(removed)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.order.lock().await.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use depq_core::{DependencyState, Error};
    use crate::QueueError;

    fn queue() -> LocalOrderedQueue {
        LocalOrderedQueue::new(Duration::from_millis(20))
    }

    fn job(id: &str) -> Job {
        Job::new("test", serde_json::json!({})).with_id(id)
    }

    #[tokio::test]
    async fn dispatches_each_job_once() {
        let queue = queue();
        let cancel = CancellationToken::new();
        queue.put(job("a")).await.unwrap();
        queue.put(job("b")).await.unwrap();

        let first = queue.next(&cancel).await.unwrap().unwrap();
        let second = queue.next(&cancel).await.unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.status.in_progress);
        assert_eq!(first.status.owner, queue.owner());

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.total, stats.pending, stats.running), (2, 2, 2));

        queue.complete(&first).await.unwrap();
        queue.complete(&second).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert!(stats.is_drained());
    }

    #[tokio::test]
    async fn dispatch_order_is_shuffled_while_ready_is_non_empty() {
        let queue = queue();
        let cancel = CancellationToken::new();
        let submitted: Vec<String> = (0..20).map(|i| format!("r{i:02}")).collect();
        for id in &submitted {
            queue.put(job(id)).await.unwrap();
        }

        let mut dispatched = Vec::new();
        for _ in 0..submitted.len() {
            let job = queue.next(&cancel).await.unwrap().unwrap();
            dispatched.push(job.id.as_str().to_string());
        }
        assert_ne!(dispatched, submitted);

        dispatched.sort();
        assert_eq!(dispatched, submitted);
    }

    #[tokio::test]
    async fn duplicate_put_is_rejected() {
        let queue = queue();
        queue.put(job("a")).await.unwrap();
        let err = queue.put(job("a")).await.unwrap_err();
        assert!(matches!(err, QueueError::Core(Error::DuplicateJob(_))));
    }

    #[tokio::test]
    async fn next_returns_none_when_cancelled() {
        let queue = queue();
        let cancel = CancellationToken::new();
        queue
            .put(job("blocked").with_dependency_state(DependencyState::Blocked))
            .await
            .unwrap();

        let waiter = {
            let cancel = cancel.clone();
            async move { queue.next(&cancel).await }
        };
        let handle = tokio::spawn(waiter);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(handle.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn put_wakes_a_waiting_consumer() {
        let queue = Arc::new(LocalOrderedQueue::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.next(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(job("late")).await.unwrap();

        let dispatched = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(dispatched.id.as_str(), "late");
    }

    #[tokio::test]
    async fn waits_for_wait_until() {
        let queue = queue();
        let cancel = CancellationToken::new();
        let at = Utc::now() + chrono::Duration::milliseconds(100);
        queue.put(job("later").wait_until(at)).await.unwrap();

        let dispatched = queue.next(&cancel).await.unwrap().unwrap();
        assert!(Utc::now() >= at);
        assert_eq!(dispatched.id.as_str(), "later");
    }

    #[tokio::test]
    async fn released_job_is_dispatched_again() {
        let queue = queue();
        let cancel = CancellationToken::new();
        queue.put(job("flaky")).await.unwrap();

        let first = queue.next(&cancel).await.unwrap().unwrap();
        let failed = queue.fail(&first, "boom").await.unwrap();
        assert_eq!(failed.status.err_count, 1);
        queue.release(&failed).await.unwrap();

        let again = queue.next(&cancel).await.unwrap().unwrap();
        assert_eq!(again.id.as_str(), "flaky");
        assert_eq!(again.errors, vec!["boom".to_string()]);

        assert_eq!(queue.delete("flaky").await.unwrap(), 1);
        assert!(queue.get("flaky").await.unwrap().is_none());
        assert!(queue.heartbeat(&again).await.is_err());
    }
}
