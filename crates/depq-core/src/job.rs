//! The job record: identity, status, timing window, dependency and scopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Dependency, DependencyState, JobId};

/// The unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    /// Partition key that lets several logical queues share one store.
    pub group: String,
    /// Informational only; dispatch order does not depend on it.
    pub priority: i32,
    /// Schema version of the body.
    pub version: i32,
    /// Serialized payload.
    pub body: serde_json::Value,
    pub status: JobStatus,
    pub time_info: TimeInfo,
    pub dependency: Dependency,
    /// Exclusive resource tokens held while the job runs.
    pub scopes: Vec<String>,
    /// Append-only failure log.
    pub errors: Vec<String>,
}

impl Job {
    /// Create a job with a generated id and a zero-valued status.
    pub fn new(job_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: JobId::generate(),
            job_type: job_type.into(),
            group: String::new(),
            priority: 0,
            version: 0,
            body,
            status: JobStatus::default(),
            time_info: TimeInfo::new(Utc::now()),
            dependency: Dependency::default(),
            scopes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn wait_until(mut self, at: DateTime<Utc>) -> Self {
        self.time_info.wait_until = Some(at);
        self
    }

    pub fn dispatch_by(mut self, at: DateTime<Utc>) -> Self {
        self.time_info.dispatch_by = Some(at);
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.time_info.max_time = Some(max_time);
        self
    }

    pub fn with_dependency_state(mut self, state: DependencyState) -> Self {
        self.dependency.state = state;
        self
    }

    pub fn depends_on(mut self, edge: impl Into<JobId>) -> Self {
        self.dependency.edges.push(edge.into());
        self
    }

    /// Record that `owner` started running this job.
    pub fn mark_in_progress(&mut self, owner: &str, now: DateTime<Utc>) {
        self.status.owner = owner.to_string();
        self.status.in_progress = true;
        self.status.touch(now, 1);
        if self.time_info.started.is_none() {
            self.time_info.started = Some(now);
        }
    }

    /// Mark the job terminally completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status.completed = true;
        self.status.in_progress = false;
        self.status.touch(now, JobStatus::COMPLETION_DELTA);
        self.time_info.ended = Some(now);
    }

    /// Append an execution failure.
    pub fn record_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.errors.push(message.into());
        self.status.err_count += 1;
        self.status.touch(now, 1);
    }
}

/// Ownership and progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Empty when unclaimed.
    pub owner: String,
    /// Terminal once set.
    pub completed: bool,
    pub in_progress: bool,
    /// Instant of the last status mutation; `None` before the first one.
    pub mod_ts: Option<DateTime<Utc>>,
    /// Version counter; never decreases.
    pub mod_count: i32,
    pub err_count: i32,
}

impl JobStatus {
    /// `mod_count` increment applied by completion, distinguishable from the
    /// `+1` of claims and heartbeats.
    pub const COMPLETION_DELTA: i32 = 3;

    pub fn is_claimed(&self) -> bool {
        !self.owner.is_empty()
    }

    /// Whether the lease recorded in this status has expired at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lock_timeout: Duration) -> bool {
        match self.mod_ts {
            None => true,
            Some(ts) => ts <= lease_cutoff(now, lock_timeout),
        }
    }

    /// Record a status mutation at `now`, bumping `mod_count` by `delta`.
    pub fn touch(&mut self, now: DateTime<Utc>, delta: i32) {
        self.mod_ts = Some(now);
        self.mod_count += delta;
    }
}

/// The instant before which an unrefreshed lease is considered abandoned.
pub fn lease_cutoff(now: DateTime<Utc>, lock_timeout: Duration) -> DateTime<Utc> {
    let timeout = chrono::Duration::from_std(lock_timeout).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Timing window of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// Not runnable before this instant.
    pub wait_until: Option<DateTime<Utc>>,
    /// Considered stale after this instant.
    pub dispatch_by: Option<DateTime<Utc>>,
    /// Execution budget.
    pub max_time: Option<Duration>,
}

impl TimeInfo {
    pub fn new(created: DateTime<Utc>) -> Self {
        Self {
            created,
            started: None,
            ended: None,
            wait_until: None,
            dispatch_by: None,
            max_time: None,
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        self.is_dispatchable_at(Utc::now())
    }

    pub fn is_dispatchable_at(&self, now: DateTime<Utc>) -> bool {
        self.wait_until.is_none_or(|at| now >= at)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.dispatch_by.is_some_and(|by| now > by)
    }
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}
