//! Core domain types for the depq job queue.
//!
//! This crate contains:
//! - Job identifiers and the job record (status, timing, dependency, scopes)
//! - The dependency resolver seam
//! - The adaptive order classifier used by in-process queues
//! - Queue statistics

pub mod dependency;
pub mod error;
pub mod id;
pub mod job;
pub mod order;
pub mod stats;

pub use dependency::{Dependency, DependencyResolver, DependencyState, StoredState};
pub use error::{Error, Result};
pub use id::JobId;
pub use job::{Job, JobStatus, TimeInfo, lease_cutoff};
pub use order::{AdaptiveOrder, Bucket};
pub use stats::QueueStats;
