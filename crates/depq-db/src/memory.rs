//! In-memory job store.
//!
//! Mirrors [`PgJobStore`](crate::PgJobStore) semantics for tests and
//! single-process deployments. One mutex guards both the job records and the
//! scope table, so scope registration and the claim it belongs to are atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depq_core::{Dependency, Job, JobId, QueueStats, TimeInfo, lease_cutoff};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::store::{ClaimOutcome, ClaimRequest, JobStore, Lease};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// scope token -> holding job
    scopes: HashMap<String, JobId>,
}

impl State {
    fn job_mut(&mut self, id: &str) -> DbResult<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    /// Returns the first scope held by another job, registering nothing in
    /// that case.
    fn register(&mut self, id: &JobId, scopes: &[String]) -> Option<String> {
        if let Some(held) = scopes
            .iter()
            .find(|s| self.scopes.get(*s).is_some_and(|holder| holder != id))
        {
            return Some(held.clone());
        }
        for scope in scopes {
            self.scopes.insert(scope.clone(), id.clone());
        }
        None
    }

    fn release(&mut self, id: &str) -> u64 {
        let before = self.scopes.len();
        self.scopes.retain(|_, holder| holder.as_str() != id);
        (before - self.scopes.len()) as u64
    }

    /// The job a lease refers to, if the lease is still current.
    fn guarded(&mut self, lease: &Lease) -> Option<&mut Job> {
        self.jobs.get_mut(lease.id.as_str()).filter(|job| {
            !job.status.completed
                && job.status.owner == lease.owner
                && job.status.mod_count == lease.mod_count
        })
    }

    fn complete(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if job.status.completed {
            return false;
        }
        job.mark_completed(now);
        self.release(id);
        true
    }
}

fn can_update(job: &Job, owner: &str, mod_count: i32, cutoff: DateTime<Utc>) -> bool {
    let status = &job.status;
    if status.completed {
        return false;
    }
    (status.owner == owner && status.mod_count == mod_count)
        || status.mod_ts.is_none_or(|ts| ts <= cutoff)
}

/// Job store held entirely in process memory.
pub struct MemoryJobStore {
    state: Mutex<State>,
    lock_timeout: Duration,
}

impl MemoryJobStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lock_timeout,
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        lease_cutoff(now, self.lock_timeout)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    async fn insert(&self, job: &Job) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> DbResult<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn delete(&self, id: &str) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        if state.jobs.remove(id).is_none() {
            return Ok(0);
        }
        state.release(id);
        Ok(1)
    }

    async fn ids(&self) -> DbResult<Vec<JobId>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<&Job> = state.jobs.values().collect();
        jobs.sort_by(|a, b| b.status.mod_ts.cmp(&a.status.mod_ts));
        Ok(jobs.into_iter().map(|j| j.id.clone()).collect())
    }

    async fn update_time_info(&self, id: &str, time_info: &TimeInfo) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.job_mut(id)?.time_info = time_info.clone();
        Ok(())
    }

    async fn update_dependency(&self, id: &str, dependency: &Dependency) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.job_mut(id)?.dependency = dependency.clone();
        Ok(())
    }

    async fn update_job(&self, id: &str, job: &Job) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let stored = state.job_mut(id)?;
        stored.job_type = job.job_type.clone();
        stored.group = job.group.clone();
        stored.version = job.version;
        stored.priority = job.priority;
        stored.scopes = job.scopes.clone();
        Ok(())
    }

    async fn update_body(&self, id: &str, body: &serde_json::Value) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.job_mut(id)?.body = body.clone();
        Ok(())
    }

    async fn next_candidates(
        &self,
        group: &str,
        timing_aware: bool,
        after: Option<&JobId>,
        limit: usize,
    ) -> DbResult<Vec<JobId>> {
        let now = Utc::now();
        let state = self.state.lock().await;

        let mut ids: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.group == group && !j.status.completed)
            .filter(|j| after.is_none_or(|after| j.id > *after))
            .filter(|j| !j.status.in_progress || j.status.lease_expired(now, self.lock_timeout))
            .filter(|j| {
                !timing_aware
                    || (j.time_info.is_dispatchable_at(now) && !j.time_info.is_stale_at(now))
            })
            .map(|j| j.id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn claim(&self, request: &ClaimRequest) -> DbResult<ClaimOutcome> {
        let now = Utc::now();
        let cutoff = self.cutoff(now);
        let mut state = self.state.lock().await;

        let Some(job) = state.jobs.get(request.id.as_str()) else {
            return Err(DbError::NotFound(format!("job {}", request.id)));
        };
        if !can_update(job, &request.owner, request.mod_count, cutoff) {
            return Ok(ClaimOutcome::Conflict);
        }
        if let Some(held) = state.register(&request.id, &request.scopes) {
            return Ok(ClaimOutcome::ScopeConflict(held));
        }

        let job = state.job_mut(request.id.as_str())?;
        job.mark_in_progress(&request.owner, now);
        Ok(ClaimOutcome::Acquired(Lease {
            id: job.id.clone(),
            owner: request.owner.clone(),
            mod_count: job.status.mod_count,
        }))
    }

    async fn heartbeat(&self, lease: &Lease) -> DbResult<Option<Lease>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(job) = state.guarded(lease) else {
            return Ok(None);
        };
        job.status.touch(now, 1);
        Ok(Some(lease.bumped(1)))
    }

    async fn release(&self, lease: &Lease) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.guarded(lease) else {
            return Ok(false);
        };
        job.status.owner.clear();
        job.status.in_progress = false;
        job.status.mod_count += 1;
        job.status.mod_ts = None;
        state.release(lease.id.as_str());
        Ok(true)
    }

    async fn record_error(&self, lease: &Lease, message: &str) -> DbResult<Option<Lease>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(job) = state.guarded(lease) else {
            return Ok(None);
        };
        job.record_error(message, now);
        Ok(Some(lease.bumped(1)))
    }

    async fn complete(&self, lease: &Lease) -> DbResult<bool> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.guarded(lease).is_none() {
            return Ok(false);
        }
        Ok(state.complete(lease.id.as_str(), now))
    }

    async fn force_complete(&self, id: &str) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.complete(id, Utc::now()))
    }

    async fn complete_many(&self, ids: &[JobId]) -> DbResult<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let completed = ids
            .iter()
            .filter(|id| state.complete(id.as_str(), now))
            .count();
        Ok(completed as u64)
    }

    async fn register_scopes(&self, id: &str, scopes: &[String]) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let id = state.job_mut(id)?.id.clone();
        match state.register(&id, scopes) {
            Some(held) => Err(DbError::ScopeConflict(held)),
            None => Ok(()),
        }
    }

    async fn release_scopes(&self, id: &str) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        Ok(state.release(id))
    }

    async fn stats(&self, group: &str) -> DbResult<QueueStats> {
        let state = self.state.lock().await;
        let jobs: Vec<&Job> = state.jobs.values().filter(|j| j.group == group).collect();
        let total = jobs.len();
        let pending = jobs.iter().filter(|j| !j.status.completed).count();
        let in_progress = jobs
            .iter()
            .filter(|j| !j.status.completed && j.status.in_progress)
            .count();
        Ok(QueueStats::from_counts(total, pending, in_progress))
    }

    async fn active_groups(&self, since: DateTime<Utc>) -> DbResult<Vec<String>> {
        let state = self.state.lock().await;
        let groups: BTreeSet<String> = state
            .jobs
            .values()
            .filter(|j| !j.status.completed || j.status.mod_ts.is_some_and(|ts| ts >= since))
            .map(|j| j.group.clone())
            .collect();
        Ok(groups.into_iter().collect())
    }
}
