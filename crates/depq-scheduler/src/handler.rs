//! Job handlers, dispatched by job type.

use async_trait::async_trait;
use depq_core::Job;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{QueueError, QueueResult};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Handlers keyed by job type. Built once, then shared read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> QueueResult<()> {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            return Err(QueueError::DuplicateHandler(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `job`. An unknown type is a failure of the job.
    pub async fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        let handler = self
            .get(&job.job_type)
            .ok_or_else(|| QueueError::UnknownJobType(job.job_type.clone()))?;
        handler.handle(job).await
    }
}
