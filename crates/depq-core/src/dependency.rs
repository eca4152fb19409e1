//! Dependency descriptors and the resolver seam.

use serde::{Deserialize, Serialize};

use crate::{Job, JobId};

/// Dependency state of a job, as reported by a [`DependencyResolver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    /// Runnable now.
    #[default]
    Ready,
    /// Waiting on another job.
    Blocked,
    /// The resolver cannot decide yet.
    Unresolved,
    /// Already satisfied; the job should be skipped rather than executed.
    Passed,
}

impl DependencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyState::Ready => "ready",
            DependencyState::Blocked => "blocked",
            DependencyState::Unresolved => "unresolved",
            DependencyState::Passed => "passed",
        }
    }
}

impl std::str::FromStr for DependencyState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(DependencyState::Ready),
            "blocked" => Ok(DependencyState::Blocked),
            "unresolved" => Ok(DependencyState::Unresolved),
            "passed" => Ok(DependencyState::Passed),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown dependency state '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for DependencyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependency descriptor attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Kind of dependency (e.g. "always", "edges").
    pub dep_type: String,
    /// Schema version of the descriptor.
    pub version: i32,
    /// Opaque descriptor payload.
    pub descriptor: serde_json::Value,
    /// Last state recorded for this dependency.
    pub state: DependencyState,
    /// Ids of the jobs this one depends on.
    pub edges: Vec<JobId>,
}

impl Default for Dependency {
    fn default() -> Self {
        Self {
            dep_type: "always".to_string(),
            version: 0,
            descriptor: serde_json::Value::Null,
            state: DependencyState::Ready,
            edges: Vec::new(),
        }
    }
}

/// Computes the dependency state of a job.
///
/// Implementations must be side-effect free; they are called on every
/// classification and re-filter pass.
pub trait DependencyResolver: Send + Sync {
    fn state(&self, job: &Job) -> DependencyState;
}

/// Resolver that trusts the state recorded on the job itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredState;

impl DependencyResolver for StoredState {
    fn state(&self, job: &Job) -> DependencyState {
        job.dependency.state
    }
}

impl<F> DependencyResolver for F
where
    F: Fn(&Job) -> DependencyState + Send + Sync,
{
    fn state(&self, job: &Job) -> DependencyState {
        self(job)
    }
}
