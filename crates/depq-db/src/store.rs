//! The claiming protocol.
//!
//! Workers never take locks. A claim is a compare-and-swap on the job's
//! status row, accepted when either
//!
//! - the caller owns the job and presents the current `mod_count`, or
//! - the last status change is older than `now - lock_timeout`, meaning the
//!   previous lease was abandoned and may be stolen.
//!
//! Operations under a [`Lease`] (heartbeat, release, error, completion) take
//! the first branch only: once another worker has stolen the job, the old
//! lease no longer matches.
//!
//! Exclusive resources are modelled as scope tokens with a store-wide
//! uniqueness guarantee.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depq_core::{Dependency, Job, JobId, QueueStats, TimeInfo};
use std::time::Duration;

use crate::DbResult;

/// A request to take ownership of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub id: JobId,
    pub owner: String,
    /// The `mod_count` the caller last observed.
    pub mod_count: i32,
    /// Scopes to register for the duration of the claim.
    pub scopes: Vec<String>,
}

impl ClaimRequest {
    /// Build a request from the caller's view of a job.
    pub fn for_job(job: &Job, owner: impl Into<String>) -> Self {
        Self {
            id: job.id.clone(),
            owner: owner.into(),
            mod_count: job.status.mod_count,
            scopes: job.scopes.clone(),
        }
    }
}

/// Proof of ownership returned by a successful claim.
///
/// Every guarded mutation must present the most recent lease; each one
/// that bumps `mod_count` hands back a replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: JobId,
    pub owner: String,
    pub mod_count: i32,
}

impl Lease {
    pub(crate) fn bumped(&self, delta: i32) -> Self {
        Self {
            mod_count: self.mod_count + delta,
            ..self.clone()
        }
    }
}

/// Result of a claim attempt. Losing a race is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired(Lease),
    /// Another owner holds an unexpired lease, or `mod_count` was stale.
    Conflict,
    /// The named scope is held by another job.
    ScopeConflict(String),
}

impl ClaimOutcome {
    pub fn lease(self) -> Option<Lease> {
        match self {
            ClaimOutcome::Acquired(lease) => Some(lease),
            _ => None,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Lease length after which an unrefreshed claim may be stolen.
    fn lock_timeout(&self) -> Duration;

    /// Insert a new job. Fails with `Duplicate` if the id exists.
    async fn insert(&self, job: &Job) -> DbResult<()>;
    async fn get(&self, id: &str) -> DbResult<Job>;
    /// Remove a job and everything attached to it; returns rows removed.
    async fn delete(&self, id: &str) -> DbResult<u64>;
    /// All job ids, most recently modified first.
    async fn ids(&self) -> DbResult<Vec<JobId>>;
    async fn update_time_info(&self, id: &str, time_info: &TimeInfo) -> DbResult<()>;
    async fn update_dependency(&self, id: &str, dependency: &Dependency) -> DbResult<()>;
    /// Persist `job`'s type, group, version, priority and requested scopes.
    async fn update_job(&self, id: &str, job: &Job) -> DbResult<()>;
    async fn update_body(&self, id: &str, body: &serde_json::Value) -> DbResult<()>;

    /// Ids of jobs in `group` that are neither completed nor held by a live
    /// lease. With `timing_aware` set, jobs before their `wait_until` or past
    /// their `dispatch_by` are excluded too.
    ///
    /// Ids come back in ascending order, starting after `after`, so callers
    /// page through the group by passing the last id of the previous page.
    async fn next_candidates(
        &self,
        group: &str,
        timing_aware: bool,
        after: Option<&JobId>,
        limit: usize,
    ) -> DbResult<Vec<JobId>>;

    /// Take ownership of a job and register its scopes, atomically.
    async fn claim(&self, request: &ClaimRequest) -> DbResult<ClaimOutcome>;
    /// Refresh a lease. `None` means the lease was lost.
    async fn heartbeat(&self, lease: &Lease) -> DbResult<Option<Lease>>;
    /// Give up a lease and its scopes; the job is claimable immediately.
    async fn release(&self, lease: &Lease) -> DbResult<bool>;
    /// Append an execution failure under a lease.
    async fn record_error(&self, lease: &Lease, message: &str) -> DbResult<Option<Lease>>;
    /// Complete a job under a lease, releasing its scopes.
    async fn complete(&self, lease: &Lease) -> DbResult<bool>;

    /// Complete a job regardless of ownership.
    async fn force_complete(&self, id: &str) -> DbResult<bool>;
    /// Complete many jobs regardless of ownership; returns the number completed.
    async fn complete_many(&self, ids: &[JobId]) -> DbResult<u64>;

    /// Register scope tokens for a job. Fails with `ScopeConflict` if any
    /// token is held by a different job; nothing is registered in that case.
    async fn register_scopes(&self, id: &str, scopes: &[String]) -> DbResult<()>;
    async fn release_scopes(&self, id: &str) -> DbResult<u64>;

    async fn stats(&self, group: &str) -> DbResult<QueueStats>;
    /// Groups with pending jobs, or with jobs completed since `since`.
    async fn active_groups(&self, since: DateTime<Utc>) -> DbResult<Vec<String>>;
}

/// Behaviour every [`JobStore`] must share, run against each implementation.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::DbError;
    use chrono::Duration as ChronoDuration;
    use depq_core::DependencyState;

    pub fn job(group: &str) -> Job {
        Job::new("conformance", serde_json::json!({ "n": 1 })).in_group(group)
    }

    pub fn unique_group() -> String {
        format!("test-{}", JobId::generate())
    }

    pub async fn insert_and_get<S: JobStore>(store: &S) {
        let group = unique_group();
        let now = Utc::now();
        let original = job(&group)
            .with_priority(7)
            .with_scopes(["ignored-until-claim"])
            .wait_until(now + ChronoDuration::seconds(30))
            .with_max_time(Duration::from_secs(90))
            .with_dependency_state(DependencyState::Blocked)
            .depends_on("parent-a")
            .depends_on("parent-b");
        store.insert(&original).await.unwrap();

        let fetched = store.get(original.id.as_str()).await.unwrap();
        assert_eq!(fetched.job_type, "conformance");
        assert_eq!(fetched.group, group);
        assert_eq!(fetched.priority, 7);
        assert_eq!(fetched.body, serde_json::json!({ "n": 1 }));
        assert_eq!(fetched.status.mod_count, 0);
        assert!(fetched.status.owner.is_empty());
        assert_eq!(fetched.time_info.max_time, Some(Duration::from_secs(90)));
        assert!(fetched.time_info.started.is_none());
        assert!(fetched.time_info.dispatch_by.is_none());
        assert_eq!(fetched.dependency.state, DependencyState::Blocked);
        assert_eq!(fetched.dependency.edges.len(), 2);

        let err = store.insert(&original).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));

        let err = store.get("no-such-job").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    pub async fn metadata_and_body_updates<S: JobStore>(store: &S) {
        let group = unique_group();
        let original = job(&group);
        store.insert(&original).await.unwrap();
        let status = store.get(original.id.as_str()).await.unwrap().status;

        let moved_to = unique_group();
        let edited = original
            .clone()
            .in_group(&moved_to)
            .with_priority(3)
            .with_scopes(["report-lock"]);
        let edited = Job {
            job_type: "reindex".to_string(),
            version: 2,
            ..edited
        };
        store.update_job(original.id.as_str(), &edited).await.unwrap();
        store
            .update_body(original.id.as_str(), &serde_json::json!({ "n": 2 }))
            .await
            .unwrap();

        let fetched = store.get(original.id.as_str()).await.unwrap();
        assert_eq!(fetched.job_type, "reindex");
        assert_eq!(fetched.group, moved_to);
        assert_eq!((fetched.version, fetched.priority), (2, 3));
        assert_eq!(fetched.scopes, vec!["report-lock".to_string()]);
        assert_eq!(fetched.body, serde_json::json!({ "n": 2 }));
        // Status is untouched by metadata edits.
        assert_eq!(fetched.status, status);

        assert!(store.next_candidates(&group, false, None, 10).await.unwrap().is_empty());
        assert_eq!(
            store.next_candidates(&moved_to, false, None, 10).await.unwrap(),
            vec![original.id.clone()]
        );

        let err = store.update_job("no-such-job", &edited).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        let err = store
            .update_body("no-such-job", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    pub async fn claim_race<S: JobStore>(store: &S) {
        let j = job(&unique_group());
        store.insert(&j).await.unwrap();

        let a = ClaimRequest::for_job(&j, "worker-a");
        let b = ClaimRequest::for_job(&j, "worker-b");
        let (ra, rb) = futures::join!(store.claim(&a), store.claim(&b));
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let winners: Vec<&Lease> = outcomes
            .iter()
            .filter_map(|o| match o {
                ClaimOutcome::Acquired(lease) => Some(lease),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1, "exactly one claim may win: {outcomes:?}");
        assert!(outcomes.contains(&ClaimOutcome::Conflict));

        let winner = winners[0];
        let status = store.get(j.id.as_str()).await.unwrap().status;
        assert_eq!(status.owner, winner.owner);
        assert_eq!(status.mod_count, 1);
        assert!(status.in_progress);

        // The loser's stale view cannot win a retry.
        let loser = if winner.owner == "worker-a" { b } else { a };
        assert_eq!(store.claim(&loser).await.unwrap(), ClaimOutcome::Conflict);
    }

    pub async fn lock_stealing<S: JobStore>(store: &S) {
        let j = job(&unique_group());
        store.insert(&j).await.unwrap();

        let lease_a = store
            .claim(&ClaimRequest::for_job(&j, "worker-a"))
            .await
            .unwrap()
            .lease()
            .unwrap();

        let seen = store.get(j.id.as_str()).await.unwrap();
        let steal = ClaimRequest::for_job(&seen, "worker-b");
        assert_eq!(store.claim(&steal).await.unwrap(), ClaimOutcome::Conflict);

        tokio::time::sleep(store.lock_timeout() + Duration::from_millis(100)).await;

        let lease_b = store.claim(&steal).await.unwrap().lease().unwrap();
        assert_eq!(lease_b.owner, "worker-b");
        assert_eq!(lease_b.mod_count, 2);

        assert!(!store.complete(&lease_a).await.unwrap());
        assert!(store.heartbeat(&lease_a).await.unwrap().is_none());
        assert!(store.complete(&lease_b).await.unwrap());

        let done = store.get(j.id.as_str()).await.unwrap();
        assert!(done.status.completed);
        assert!(!done.status.in_progress);
        assert_eq!(done.status.mod_count, 2 + 3);
        assert!(done.time_info.ended.is_some());
    }

    pub async fn scope_exclusivity<S: JobStore>(store: &S) {
        let group = unique_group();
        let scope = format!("db-lock-{group}");
        let x = job(&group).with_scopes([scope.clone()]);
        let y = job(&group).with_scopes([scope.clone()]);
        store.insert(&x).await.unwrap();
        store.insert(&y).await.unwrap();

        store.register_scopes(x.id.as_str(), &[scope.clone()]).await.unwrap();
        // Re-registering a scope the job already holds is not a conflict.
        store.register_scopes(x.id.as_str(), &[scope.clone()]).await.unwrap();

        let err = store
            .register_scopes(y.id.as_str(), &[scope.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ScopeConflict(ref s) if *s == scope));

        let outcome = store.claim(&ClaimRequest::for_job(&y, "worker-y")).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::ScopeConflict(scope.clone()));
        let untouched = store.get(y.id.as_str()).await.unwrap();
        assert_eq!(untouched.status.mod_count, 0);
        assert!(untouched.status.owner.is_empty());

        assert!(store.force_complete(x.id.as_str()).await.unwrap());
        store.register_scopes(y.id.as_str(), &[scope.clone()]).await.unwrap();
        assert_eq!(store.release_scopes(y.id.as_str()).await.unwrap(), 1);

        let lease = store
            .claim(&ClaimRequest::for_job(&y, "worker-y"))
            .await
            .unwrap()
            .lease()
            .unwrap();
        assert!(store.complete(&lease).await.unwrap());
        store.register_scopes(x.id.as_str(), &[scope]).await.unwrap();
    }

    pub async fn heartbeat_release_and_errors<S: JobStore>(store: &S) {
        let j = job(&unique_group());
        store.insert(&j).await.unwrap();

        let lease = store
            .claim(&ClaimRequest::for_job(&j, "worker-a"))
            .await
            .unwrap()
            .lease()
            .unwrap();
        let lease = store.heartbeat(&lease).await.unwrap().unwrap();
        assert_eq!(lease.mod_count, 2);

        let lease = store.record_error(&lease, "boom").await.unwrap().unwrap();
        let failed = store.get(j.id.as_str()).await.unwrap();
        assert_eq!(failed.status.err_count, 1);
        assert_eq!(failed.status.mod_count, 3);
        assert_eq!(failed.errors, vec!["boom".to_string()]);
        assert!(!failed.status.completed);

        assert!(store.release(&lease).await.unwrap());
        let released = store.get(j.id.as_str()).await.unwrap();
        assert!(!released.status.in_progress);
        assert!(released.status.owner.is_empty());
        assert_eq!(released.status.mod_count, 4);

        // Claimable at once by anyone.
        let again = store
            .claim(&ClaimRequest::for_job(&released, "worker-b"))
            .await
            .unwrap();
        assert!(matches!(again, ClaimOutcome::Acquired(ref l) if l.mod_count == 5));
        assert!(!store.release(&lease).await.unwrap());
    }

    pub async fn candidates<S: JobStore>(store: &S) {
        let group = unique_group();
        let now = Utc::now();

        let plain = job(&group);
        let later = job(&group).wait_until(now + ChronoDuration::hours(1));
        let expired = job(&group).dispatch_by(now - ChronoDuration::seconds(1));
        let running = job(&group);
        let done = job(&group);
        let elsewhere = job(&unique_group());
        for j in [&plain, &later, &expired, &running, &done, &elsewhere] {
            store.insert(j).await.unwrap();
        }
        store
            .claim(&ClaimRequest::for_job(&running, "w"))
            .await
            .unwrap()
            .lease()
            .unwrap();
        store.force_complete(done.id.as_str()).await.unwrap();

        let basic = store.next_candidates(&group, false, None, 100).await.unwrap();
        let mut expected = vec![plain.id.clone(), later.id.clone(), expired.id.clone()];
        expected.sort();
        assert_eq!(basic, expected);

        let timed = store.next_candidates(&group, true, None, 100).await.unwrap();
        assert_eq!(timed, vec![plain.id.clone()]);

        // Paging one id at a time visits every candidate once, in order.
        let mut paged = Vec::new();
        let mut after = None;
        while let Some(next) = store
            .next_candidates(&group, false, after.as_ref(), 1)
            .await
            .unwrap()
            .pop()
        {
            paged.push(next.clone());
            after = Some(next);
        }
        assert_eq!(paged, expected);

        let first = store.next_candidates(&group, false, None, 2).await.unwrap();
        assert_eq!(first, expected[..2].to_vec());

        // Extending the deadline revives the expired job.
        let mut revived = store.get(expired.id.as_str()).await.unwrap().time_info;
        revived.dispatch_by = Some(now + ChronoDuration::hours(1));
        store
            .update_time_info(expired.id.as_str(), &revived)
            .await
            .unwrap();
        assert_eq!(store.next_candidates(&group, true, None, 100).await.unwrap().len(), 2);
    }

    pub async fn stats_and_completion<S: JobStore>(store: &S) {
        let group = unique_group();
        let jobs: Vec<Job> = (0..4).map(|_| job(&group)).collect();
        for j in &jobs {
            store.insert(j).await.unwrap();
        }
        store
            .claim(&ClaimRequest::for_job(&jobs[0], "w"))
            .await
            .unwrap()
            .lease()
            .unwrap();

        let completed = store
            .complete_many(&[jobs[1].id.clone(), jobs[2].id.clone()])
            .await
            .unwrap();
        assert_eq!(completed, 2);
        assert_eq!(store.get(jobs[1].id.as_str()).await.unwrap().status.mod_count, 3);

        let stats = store.stats(&group).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 2);

        let active = store
            .active_groups(Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert!(active.contains(&group));

        assert_eq!(store.delete(jobs[3].id.as_str()).await.unwrap(), 1);
        assert_eq!(store.delete(jobs[3].id.as_str()).await.unwrap(), 0);
        assert_eq!(store.stats(&group).await.unwrap().total, 3);

        let err = store
            .update_dependency(jobs[3].id.as_str(), &Dependency::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    pub async fn ids_newest_first<S: JobStore>(store: &S) {
        let group = unique_group();
        let older = job(&group);
        let newer = job(&group);
        store.insert(&older).await.unwrap();
        store.insert(&newer).await.unwrap();
        store
            .claim(&ClaimRequest::for_job(&newer, "w"))
            .await
            .unwrap()
            .lease()
            .unwrap();

        let ids = store.ids().await.unwrap();
        let pos = |id: &JobId| ids.iter().position(|x| x == id).unwrap();
        assert!(pos(&newer.id) < pos(&older.id));
    }
}
