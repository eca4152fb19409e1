//! Adaptive dispatch ordering.
//!
//! [`AdaptiveOrder`] partitions known jobs into five disjoint buckets
//! (ready, waiting, stalled, completed, passed) and re-filters them as time
//! advances and dependency states change.
//!
//! The classifier is not synchronised. Every method takes `&mut self` or
//! `&self` and the owning queue must serialise access behind a single lock.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{DependencyResolver, DependencyState, Error, Job, JobId, QueueStats, Result, StoredState};

/// Classification bucket of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Ready,
    Waiting,
    Stalled,
    Completed,
    Passed,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::Ready,
        Bucket::Waiting,
        Bucket::Stalled,
        Bucket::Completed,
        Bucket::Passed,
    ];
}

#[derive(Debug, Clone, Default)]
struct Buckets {
    ready: VecDeque<JobId>,
    waiting: Vec<JobId>,
    stalled: Vec<JobId>,
    completed: Vec<JobId>,
    passed: Vec<JobId>,
}

impl Buckets {
    fn push(&mut self, bucket: Bucket, id: JobId) {
        match bucket {
            Bucket::Ready => self.ready.push_back(id),
            Bucket::Waiting => self.waiting.push(id),
            Bucket::Stalled => self.stalled.push(id),
            Bucket::Completed => self.completed.push(id),
            Bucket::Passed => self.passed.push(id),
        }
    }

    fn find(&self, id: &str) -> Option<Bucket> {
        if self.ready.iter().any(|x| x.as_str() == id) {
            return Some(Bucket::Ready);
        }
        [
            (Bucket::Waiting, &self.waiting),
            (Bucket::Stalled, &self.stalled),
            (Bucket::Completed, &self.completed),
            (Bucket::Passed, &self.passed),
        ]
        .into_iter()
        .find(|(_, ids)| ids.iter().any(|x| x.as_str() == id))
        .map(|(bucket, _)| bucket)
    }

    fn remove(&mut self, id: &str) -> Option<Bucket> {
        let bucket = self.find(id)?;
        match bucket {
            Bucket::Ready => self.ready.retain(|x| x.as_str() != id),
            Bucket::Waiting => self.waiting.retain(|x| x.as_str() != id),
            Bucket::Stalled => self.stalled.retain(|x| x.as_str() != id),
            Bucket::Completed => self.completed.retain(|x| x.as_str() != id),
            Bucket::Passed => self.passed.retain(|x| x.as_str() != id),
        }
        Some(bucket)
    }

    fn ids(&self, bucket: Bucket) -> Vec<JobId> {
        match bucket {
            Bucket::Ready => self.ready.iter().cloned().collect(),
            Bucket::Waiting => self.waiting.clone(),
            Bucket::Stalled => self.stalled.clone(),
            Bucket::Completed => self.completed.clone(),
            Bucket::Passed => self.passed.clone(),
        }
    }

    fn len(&self, bucket: Bucket) -> usize {
        match bucket {
            Bucket::Ready => self.ready.len(),
            Bucket::Waiting => self.waiting.len(),
            Bucket::Stalled => self.stalled.len(),
            Bucket::Completed => self.completed.len(),
            Bucket::Passed => self.passed.len(),
        }
    }
}

/// In-memory dispatch-ordering engine.
///
/// Not safe for concurrent use without external serialisation.
pub struct AdaptiveOrder {
    jobs: HashMap<JobId, Job>,
    buckets: Buckets,
    resolver: Arc<dyn DependencyResolver>,
}

impl Default for AdaptiveOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveOrder {
    /// Create a classifier that reads dependency state from the job record.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(StoredState))
    }

    pub fn with_resolver(resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            jobs: HashMap::new(),
            buckets: Buckets::default(),
            resolver,
        }
    }

    /// Add a job, placing it in the bucket chosen by the classification rule.
    ///
    /// Fails with [`Error::DuplicateJob`] without touching any bucket when the
    /// id is already known.
    pub fn add(&mut self, job: Job) -> Result<Bucket> {
        if self.jobs.contains_key(&job.id) {
            return Err(Error::DuplicateJob(job.id));
        }

        let bucket = self.classify(&job, Utc::now());
        self.buckets.push(bucket, job.id.clone());
        self.jobs.insert(job.id.clone(), job);
        Ok(bucket)
    }

    /// Replace the stored record of a known job and reclassify it.
    ///
    /// This is how a stalled job is revived: extend its `dispatch_by` and
    /// update it. Jobs already running stay in `completed`.
    pub fn update(&mut self, job: Job) -> Result<Bucket> {
        if !self.jobs.contains_key(&job.id) {
            return Err(Error::NotFound(format!("job {}", job.id)));
        }

        let bucket = if job.status.in_progress {
            Bucket::Completed
        } else {
            self.classify(&job, Utc::now())
        };
        self.buckets.remove(job.id.as_str());
        self.buckets.push(bucket, job.id.clone());
        self.jobs.insert(job.id.clone(), job);
        Ok(bucket)
    }

    /// Remove a job; returns the number of jobs removed (0 or 1).
    ///
    /// The remaining buckets are re-filtered in full so that jobs depending
    /// on the removed one see its absence immediately.
    pub fn delete(&mut self, id: &str, cancel: &CancellationToken) -> usize {
        if self.jobs.remove(id).is_none() {
            return 0;
        }
        self.buckets.remove(id);

        let now = Utc::now();
        let mut work = self.buckets.clone();
        let done = self.update_completed(&mut work, cancel)
            && self.update_passed(&mut work, cancel)
            && self.update_waiting(&mut work, now, cancel)
            && self.update_stalled(&mut work, now, cancel)
            && self.update_ready(&mut work, cancel);
        if done {
            self.buckets = work;
        }

        1
    }

    /// Recompute bucket membership for waiting, stalled and ready jobs.
    ///
    /// Passes run on a working copy that is swapped in only once every pass
    /// has finished. Returns `false` when cancellation interrupted the
    /// re-filter, in which case the live buckets are unchanged and the call
    /// can simply be repeated.
    pub fn refilter(&mut self, cancel: &CancellationToken) -> bool {
        let now = Utc::now();
        let mut work = self.buckets.clone();
        let done = self.update_waiting(&mut work, now, cancel)
            && self.update_stalled(&mut work, now, cancel)
            && self.update_ready(&mut work, cancel);
        if done {
            self.buckets = work;
        }
        done
    }

    /// Pop the head of `ready` and mark it in progress for `owner`.
    ///
    /// The dispatched id moves to `completed`, which holds every job that is
    /// no longer eligible for dispatch.
    pub fn pop_ready(&mut self, owner: &str) -> Option<Job> {
        while let Some(id) = self.buckets.ready.pop_front() {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.status.completed || job.status.in_progress {
                self.buckets.completed.push(id);
                continue;
            }

            job.mark_in_progress(owner, Utc::now());
            let dispatched = job.clone();
            self.buckets.completed.push(id);
            return Some(dispatched);
        }
        None
    }

    /// Mark a job completed and move it to `completed`.
    pub fn complete(&mut self, id: &str) -> Result<Job> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        if !job.status.completed {
            job.mark_completed(Utc::now());
        }
        let completed = job.clone();

        if self.buckets.find(id) != Some(Bucket::Completed) {
            self.buckets.remove(id);
            self.buckets.push(Bucket::Completed, completed.id.clone());
        }
        Ok(completed)
    }

    /// Append an execution failure to a job.
    pub fn record_error(&mut self, id: &str, message: impl Into<String>) -> Result<Job> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        job.record_error(message, Utc::now());
        Ok(job.clone())
    }

    /// Give up ownership of a running job so it can be dispatched again.
    ///
    /// The id returns to `waiting`; the next re-filter reclassifies it.
    pub fn release(&mut self, id: &str) -> Result<()> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        if job.status.completed {
            return Ok(());
        }
        job.status.owner.clear();
        job.status.in_progress = false;
        job.status.touch(Utc::now(), 1);

        let id = job.id.clone();
        self.buckets.remove(id.as_str());
        self.buckets.push(Bucket::Waiting, id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn bucket_of(&self, id: &str) -> Option<Bucket> {
        self.buckets.find(id)
    }

    /// Ids in a bucket, in bucket order.
    pub fn ids(&self, bucket: Bucket) -> Vec<JobId> {
        self.buckets.ids(bucket)
    }

    pub fn bucket_len(&self, bucket: Bucket) -> usize {
        self.buckets.len(bucket)
    }

    pub fn stats(&self) -> QueueStats {
        let total = self.jobs.len();
        let pending = self.jobs.values().filter(|j| !j.status.completed).count();
        let in_progress = self
            .jobs
            .values()
            .filter(|j| !j.status.completed && j.status.in_progress)
            .count();
        QueueStats::from_counts(total, pending, in_progress)
    }

    /// Classification rule, in priority order: completed, not yet
    /// dispatchable, stale, then dependency state.
    fn classify(&self, job: &Job, now: DateTime<Utc>) -> Bucket {
        if job.status.completed {
            return Bucket::Completed;
        }
        if !job.time_info.is_dispatchable_at(now) {
            return Bucket::Waiting;
        }
        if job.time_info.is_stale_at(now) {
            return Bucket::Stalled;
        }
        match self.resolver.state(job) {
            DependencyState::Ready => Bucket::Ready,
            DependencyState::Blocked => Bucket::Waiting,
            DependencyState::Unresolved => Bucket::Stalled,
            DependencyState::Passed => Bucket::Passed,
        }
    }

    fn update_completed(&self, work: &mut Buckets, cancel: &CancellationToken) -> bool {
        let mut kept = Vec::with_capacity(work.completed.len());
        for id in std::mem::take(&mut work.completed) {
            if cancel.is_cancelled() {
                return false;
            }
            if self.jobs.contains_key(&id) {
                kept.push(id);
            }
        }
        work.completed = kept;
        true
    }

    fn update_passed(&self, work: &mut Buckets, cancel: &CancellationToken) -> bool {
        let mut kept = Vec::with_capacity(work.passed.len());
        for id in std::mem::take(&mut work.passed) {
            if cancel.is_cancelled() {
                return false;
            }
            if self.jobs.contains_key(&id) {
                kept.push(id);
            }
        }
        work.passed = kept;
        true
    }

    fn update_waiting(
        &self,
        work: &mut Buckets,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut kept = Vec::new();
        for id in std::mem::take(&mut work.waiting) {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(job) = self.jobs.get(&id) else {
                continue;
            };

            let ti = &job.time_info;
            if ti.is_stale_at(now) {
                work.stalled.push(id);
                continue;
            }
            if !ti.is_dispatchable_at(now) {
                kept.push(id);
                continue;
            }
            if job.status.completed || job.status.in_progress {
                work.completed.push(id);
                continue;
            }

            match self.resolver.state(job) {
                DependencyState::Ready => work.ready.push_back(id),
                DependencyState::Blocked => kept.push(id),
                DependencyState::Unresolved => work.stalled.push(id),
                DependencyState::Passed => work.passed.push(id),
            }
        }
        work.waiting = kept;
        true
    }

    fn update_stalled(
        &self,
        work: &mut Buckets,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut kept = Vec::new();
        for id in std::mem::take(&mut work.stalled) {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(job) = self.jobs.get(&id) else {
                continue;
            };

            if job.time_info.is_stale_at(now) {
                kept.push(id);
                continue;
            }
            if job.status.completed || job.status.in_progress {
                work.completed.push(id);
                continue;
            }
            if !job.time_info.is_dispatchable_at(now) {
                work.waiting.push(id);
                continue;
            }

            match self.resolver.state(job) {
                DependencyState::Ready => work.ready.push_back(id),
                DependencyState::Blocked => work.waiting.push(id),
                DependencyState::Unresolved => kept.push(id),
                DependencyState::Passed => work.passed.push(id),
            }
        }
        work.stalled = kept;
        true
    }

    /// Prune and randomly permute `ready`. Concurrent consumers popping from
    /// the head would otherwise contend on the same few ids.
    fn update_ready(&self, work: &mut Buckets, cancel: &CancellationToken) -> bool {
        let mut ready = Vec::with_capacity(work.ready.len());
        for id in work.ready.drain(..) {
            if cancel.is_cancelled() {
                return false;
            }
            if self.jobs.contains_key(&id) {
                ready.push(id);
            }
        }
        ready.shuffle(&mut rand::thread_rng());
        work.ready = ready.into();
        true
    }
}
