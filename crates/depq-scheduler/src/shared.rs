//! Store-backed queue shared by any number of processes.

use async_trait::async_trait;
use depq_config::QueueConfig;
use depq_core::{DependencyResolver, DependencyState, Job, JobId, QueueStats, StoredState};
use depq_db::{ClaimOutcome, ClaimRequest, DbError, JobStore, Lease};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Queue, QueueError, QueueResult};

/// Queue over a [`JobStore`]. Jobs are claimed with the optimistic claiming
/// protocol, so several `SharedQueue`s may serve the same group.
pub struct SharedQueue {
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn DependencyResolver>,
    group: String,
    owner: String,
    timing_aware: bool,
    candidate_limit: usize,
    poll_interval: Duration,
    /// Leases held by this queue, by job id.
    leases: Mutex<HashMap<JobId, Lease>>,
}

impl SharedQueue {
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            resolver: Arc::new(StoredState),
            group: config.group.clone(),
            owner: format!("shared-{}", uuid::Uuid::now_v7()),
            timing_aware: config.timing_aware,
            candidate_limit: config.candidate_limit.max(1),
            poll_interval: config.poll_interval,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// One sweep over the group's candidates, a page at a time. Lost races
    /// and skipped jobs move on to the next candidate, then the next page.
    async fn try_dispatch(&self) -> QueueResult<Option<Job>> {
        let mut after: Option<JobId> = None;
        loop {
            let mut ids = self
                .store
                .next_candidates(
                    &self.group,
                    self.timing_aware,
                    after.as_ref(),
                    self.candidate_limit,
                )
                .await?;
            let Some(last) = ids.last().cloned() else {
                return Ok(None);
            };
            let exhausted = ids.len() < self.candidate_limit;

            ids.shuffle(&mut rand::thread_rng());
            for id in ids {
                if let Some(job) = self.try_claim(id).await? {
                    return Ok(Some(job));
                }
            }

            if exhausted {
                return Ok(None);
            }
            after = Some(last);
        }
    }

    async fn try_claim(&self, id: JobId) -> QueueResult<Option<Job>> {
        let job = match self.store.get(id.as_str()).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match self.resolver.state(&job) {
            DependencyState::Ready => {}
            DependencyState::Passed => {
                if self.store.force_complete(id.as_str()).await? {
                    debug!(job_id = %id, "dependency already satisfied, skipped job");
                }
                return Ok(None);
            }
            DependencyState::Blocked | DependencyState::Unresolved => return Ok(None),
        }

        match self.store.claim(&ClaimRequest::for_job(&job, &self.owner)).await? {
            ClaimOutcome::Acquired(lease) => {
                self.leases.lock().await.insert(id.clone(), lease);
                Ok(Some(self.store.get(id.as_str()).await?))
            }
            ClaimOutcome::Conflict => {
                debug!(job_id = %id, "lost claim race");
                Ok(None)
            }
            ClaimOutcome::ScopeConflict(scope) => {
                debug!(job_id = %id, %scope, "scope busy");
                Ok(None)
            }
        }
    }

    async fn lease(&self, id: &JobId) -> QueueResult<Lease> {
        self.leases
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::LeaseLost(id.clone()))
    }

    async fn forget(&self, id: &JobId) {
        self.leases.lock().await.remove(id);
    }
}

#[async_trait]
impl Queue for SharedQueue {
    async fn put(&self, mut job: Job) -> QueueResult<()> {
        job.group = self.group.clone();
        match self.store.insert(&job).await {
            Ok(()) => Ok(()),
            Err(DbError::Duplicate(_)) => Err(depq_core::Error::DuplicateJob(job.id).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        match self.store.get(id).await {
            Ok(job) => Ok(Some(job)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn next(&self, cancel: &CancellationToken) -> QueueResult<Option<Job>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.try_dispatch().await? {
                info!(job_id = %job.id, owner = %self.owner, "claimed job");
                return Ok(Some(job));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        let lease = self.lease(&job.id).await?;
        let completed = self.store.complete(&lease).await?;
        self.forget(&job.id).await;
        if !completed {
            return Err(QueueError::LeaseLost(job.id.clone()));
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, message: &str) -> QueueResult<Job> {
        let lease = self.lease(&job.id).await?;
        match self.store.record_error(&lease, message).await? {
            Some(renewed) => {
                self.leases.lock().await.insert(job.id.clone(), renewed);
                Ok(self.store.get(job.id.as_str()).await?)
            }
            None => {
                self.forget(&job.id).await;
                Err(QueueError::LeaseLost(job.id.clone()))
            }
        }
    }

    async fn release(&self, job: &Job) -> QueueResult<()> {
        let lease = self.lease(&job.id).await?;
        let released = self.store.release(&lease).await?;
        self.forget(&job.id).await;
        if !released {
            return Err(QueueError::LeaseLost(job.id.clone()));
        }
        Ok(())
    }

    async fn heartbeat(&self, job: &Job) -> QueueResult<()> {
        let lease = self.lease(&job.id).await?;
        match self.store.heartbeat(&lease).await? {
            Some(renewed) => {
                self.leases.lock().await.insert(job.id.clone(), renewed);
                Ok(())
            }
            None => {
                self.forget(&job.id).await;
                Err(QueueError::LeaseLost(job.id.clone()))
            }
        }
    }

    async fn delete(&self, id: &str) -> QueueResult<usize> {
        self.leases.lock().await.remove(id);
        Ok(self.store.delete(id).await? as usize)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.store.stats(&self.group).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use depq_core::{Dependency, TimeInfo};
    use depq_db::{DbResult, MemoryJobStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store that can fail the next `complete`, or the `get` that
    /// follows a successful claim, with a transient database error.
    struct Flaky {
        inner: MemoryJobStore,
        fail_complete: AtomicBool,
        fail_get_after_claim: AtomicBool,
        fail_next_get: AtomicBool,
    }

    impl Flaky {
        fn new() -> Self {
            Self {
                inner: MemoryJobStore::new(Duration::from_secs(60)),
                fail_complete: AtomicBool::new(false),
                fail_get_after_claim: AtomicBool::new(false),
                fail_next_get: AtomicBool::new(false),
            }
        }
    }

    fn transient() -> DbError {
        DbError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl JobStore for Flaky {
        fn lock_timeout(&self) -> Duration {
            self.inner.lock_timeout()
        }
        async fn insert(&self, job: &Job) -> DbResult<()> {
            self.inner.insert(job).await
        }
        async fn get(&self, id: &str) -> DbResult<Job> {
            if self.fail_next_get.swap(false, Ordering::SeqCst) {
                return Err(transient());
            }
            self.inner.get(id).await
        }
        async fn delete(&self, id: &str) -> DbResult<u64> {
            self.inner.delete(id).await
        }
        async fn ids(&self) -> DbResult<Vec<JobId>> {
            self.inner.ids().await
        }
        async fn update_time_info(&self, id: &str, time_info: &TimeInfo) -> DbResult<()> {
            self.inner.update_time_info(id, time_info).await
        }
        async fn update_dependency(&self, id: &str, dependency: &Dependency) -> DbResult<()> {
            self.inner.update_dependency(id, dependency).await
        }
        async fn update_job(&self, id: &str, job: &Job) -> DbResult<()> {
            self.inner.update_job(id, job).await
        }
        async fn update_body(&self, id: &str, body: &serde_json::Value) -> DbResult<()> {
            self.inner.update_body(id, body).await
        }
        async fn next_candidates(
            &self,
            group: &str,
            timing_aware: bool,
            after: Option<&JobId>,
            limit: usize,
        ) -> DbResult<Vec<JobId>> {
            self.inner
                .next_candidates(group, timing_aware, after, limit)
                .await
        }
        async fn claim(&self, request: &ClaimRequest) -> DbResult<ClaimOutcome> {
            let outcome = self.inner.claim(request).await?;
            if matches!(outcome, ClaimOutcome::Acquired(_))
                && self.fail_get_after_claim.swap(false, Ordering::SeqCst)
            {
                self.fail_next_get.store(true, Ordering::SeqCst);
            }
            Ok(outcome)
        }
        async fn heartbeat(&self, lease: &Lease) -> DbResult<Option<Lease>> {
            self.inner.heartbeat(lease).await
        }
        async fn release(&self, lease: &Lease) -> DbResult<bool> {
            self.inner.release(lease).await
        }
        async fn record_error(&self, lease: &Lease, message: &str) -> DbResult<Option<Lease>> {
            self.inner.record_error(lease, message).await
        }
        async fn complete(&self, lease: &Lease) -> DbResult<bool> {
            if self.fail_complete.swap(false, Ordering::SeqCst) {
                return Err(transient());
            }
            self.inner.complete(lease).await
        }
        async fn force_complete(&self, id: &str) -> DbResult<bool> {
            self.inner.force_complete(id).await
        }
        async fn complete_many(&self, ids: &[JobId]) -> DbResult<u64> {
            self.inner.complete_many(ids).await
        }
        async fn register_scopes(&self, id: &str, scopes: &[String]) -> DbResult<()> {
            self.inner.register_scopes(id, scopes).await
        }
        async fn release_scopes(&self, id: &str) -> DbResult<u64> {
            self.inner.release_scopes(id).await
        }
        async fn stats(&self, group: &str) -> DbResult<QueueStats> {
            self.inner.stats(group).await
        }
        async fn active_groups(&self, since: DateTime<Utc>) -> DbResult<Vec<String>> {
            self.inner.active_groups(since).await
        }
    }

    fn config(group: &str) -> QueueConfig {
        QueueConfig {
            group: group.to_string(),
            poll_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        }
    }

    fn store(lock_timeout: Duration) -> Arc<dyn JobStore> {
        Arc::new(MemoryJobStore::new(lock_timeout))
    }

    fn job() -> Job {
        Job::new("test", serde_json::json!({}))
    }

    #[tokio::test]
    async fn two_queues_never_dispatch_the_same_job() {
        let store = store(Duration::from_secs(60));
        let a = SharedQueue::new(Arc::clone(&store), &config("g"));
        let b = SharedQueue::new(Arc::clone(&store), &config("g"));
        for _ in 0..10 {
            a.put(job()).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let mut seen = HashSet::new();
        for i in 0..10 {
            let queue = if i % 2 == 0 { &a } else { &b };
            let job = queue.next(&cancel).await.unwrap().unwrap();
            assert!(seen.insert(job.id.clone()), "{} dispatched twice", job.id);
            queue.complete(&job).await.unwrap();
        }

        let stats = b.stats().await.unwrap();
        assert_eq!((stats.total, stats.completed), (10, 10));
    }

    #[tokio::test]
    async fn groups_are_isolated() {
        let store = store(Duration::from_secs(60));
        let billing = SharedQueue::new(Arc::clone(&store), &config("billing"));
        let email = SharedQueue::new(Arc::clone(&store), &config("email"));
        billing.put(job()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(email.next(&cancel).await.unwrap().is_none());
        assert_eq!(email.stats().await.unwrap().total, 0);
        assert_eq!(billing.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn stolen_lease_is_reported_lost() {
        let store = store(Duration::from_millis(100));
        let a = SharedQueue::new(Arc::clone(&store), &config("g"));
        let b = SharedQueue::new(Arc::clone(&store), &config("g"));
        a.put(job()).await.unwrap();

        let cancel = CancellationToken::new();
        let held = a.next(&cancel).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stolen = b.next(&cancel).await.unwrap().unwrap();
        assert_eq!(stolen.id, held.id);
        assert_eq!(stolen.status.owner, b.owner());

        assert!(matches!(
            a.heartbeat(&held).await,
            Err(QueueError::LeaseLost(_))
        ));
        assert!(matches!(
            a.complete(&held).await,
            Err(QueueError::LeaseLost(_))
        ));
        b.complete(&stolen).await.unwrap();
    }

    #[tokio::test]
    async fn shared_scope_serialises_jobs() {
        let store = store(Duration::from_secs(60));
        let queue = SharedQueue::new(Arc::clone(&store), &config("g"));
        queue.put(job().with_scopes(["db-lock"])).await.unwrap();
        queue.put(job().with_scopes(["db-lock"])).await.unwrap();

        let cancel = CancellationToken::new();
        let first = queue.next(&cancel).await.unwrap().unwrap();

        let waiting = CancellationToken::new();
        let blocked = tokio::time::timeout(Duration::from_millis(100), queue.next(&waiting)).await;
        assert!(blocked.is_err(), "second job must wait for the scope");

        queue.complete(&first).await.unwrap();
        let second = queue.next(&cancel).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn passed_jobs_are_completed_without_dispatch() {
        let store = store(Duration::from_secs(60));
        let queue = SharedQueue::new(Arc::clone(&store), &config("g"))
            .with_resolver(Arc::new(|_: &Job| DependencyState::Passed));
        let skipped = job();
        queue.put(skipped.clone()).await.unwrap();

        let cancel = CancellationToken::new();
        let attempt = tokio::time::timeout(Duration::from_millis(50), queue.next(&cancel)).await;
        assert!(attempt.is_err());

        let stored = queue.get(skipped.id.as_str()).await.unwrap().unwrap();
        assert!(stored.status.completed);
        assert!(stored.status.owner.is_empty());
    }

    #[tokio::test]
    async fn ready_job_behind_a_page_of_blocked_jobs_is_dispatched() {
        let store = store(Duration::from_secs(60));
        let queue = SharedQueue::new(
            Arc::clone(&store),
            &QueueConfig {
                candidate_limit: 4,
                ..config("g")
            },
        );
        for i in 0..40 {
            queue
                .put(
                    job()
                        .with_id(format!("blocked-{i:03}"))
                        .with_dependency_state(DependencyState::Blocked),
                )
                .await
                .unwrap();
        }
        queue.put(job().with_id("ready")).await.unwrap();

        let cancel = CancellationToken::new();
        let dispatched = tokio::time::timeout(Duration::from_secs(2), queue.next(&cancel))
            .await
            .expect("ready job was never dispatched")
            .unwrap()
            .unwrap();
        assert_eq!(dispatched.id.as_str(), "ready");

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.total, stats.running), (41, 1));
    }

    #[tokio::test]
    async fn failure_then_release_allows_retry() {
        let store = store(Duration::from_secs(60));
        let queue = SharedQueue::new(Arc::clone(&store), &config("g"));
        queue.put(job()).await.unwrap();

        let cancel = CancellationToken::new();
        let first = queue.next(&cancel).await.unwrap().unwrap();
        let failed = queue.fail(&first, "boom").await.unwrap();
        assert_eq!(failed.status.err_count, 1);
        queue.release(&failed).await.unwrap();

        let retry = queue.next(&cancel).await.unwrap().unwrap();
        assert_eq!(retry.id, first.id);
        assert_eq!(retry.errors, vec!["boom".to_string()]);
        queue.complete(&retry).await.unwrap();

        let err = queue.put(retry.clone()).await.unwrap_err();
        assert!(matches!(err, QueueError::Core(depq_core::Error::DuplicateJob(_))));
    }

    #[tokio::test]
    async fn transient_completion_error_keeps_the_lease() {
        let store = Arc::new(Flaky::new());
        let queue = SharedQueue::new(store.clone(), &config("g"));
        queue.put(job()).await.unwrap();

        let cancel = CancellationToken::new();
        let running = queue.next(&cancel).await.unwrap().unwrap();

        store.fail_complete.store(true, Ordering::SeqCst);
        assert!(matches!(
            queue.complete(&running).await,
            Err(QueueError::Db(DbError::Database(_)))
        ));

        // The lease survived the failed call, so a retry succeeds.
        queue.complete(&running).await.unwrap();
        assert!(queue.get(running.id.as_str()).await.unwrap().unwrap().status.completed);
    }

    #[tokio::test]
    async fn lease_is_kept_when_reading_the_claimed_job_fails() {
        let store = Arc::new(Flaky::new());
        let queue = SharedQueue::new(store.clone(), &config("g"));
        let submitted = job();
        queue.put(submitted.clone()).await.unwrap();

        store.fail_get_after_claim.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        assert!(queue.next(&cancel).await.is_err());

        // The claim went through; its lease lets this queue hand the job back.
        let claimed = queue.get(submitted.id.as_str()).await.unwrap().unwrap();
        assert_eq!(claimed.status.owner, queue.owner());
        queue.release(&claimed).await.unwrap();

        let again = queue.next(&cancel).await.unwrap().unwrap();
        assert_eq!(again.id, submitted.id);
    }
}
