//! Queues and workers for depq.
//!
//! [`LocalOrderedQueue`] keeps jobs in process memory and orders them with
//! the adaptive classifier. [`SharedQueue`] runs over a [`depq_db::JobStore`]
//! and claims jobs optimistically, so many processes can share one group.
//! [`WorkerPool`] drives either through the [`Queue`] trait.

pub mod error;
pub mod handler;
pub mod local;
pub mod queue;
pub mod shared;
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use handler::{HandlerError, HandlerRegistry, JobHandler};
pub use local::LocalOrderedQueue;
pub use queue::Queue;
pub use shared::SharedQueue;
pub use worker::{PoolHandle, WorkerPool};
