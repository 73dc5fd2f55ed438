//! Job processor trait and the registry-backed unit of work

use crate::consumer::error::JobError;
use crate::event::Event;
use crate::registry::TaskRegistry;
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of one processing attempt
pub type JobResult = Result<(), JobError>;

/// Trait for processing decoded events
///
/// Middleware stages implement it by wrapping another processor.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Process a single event
    async fn process(&self, event: &Event) -> JobResult;

    /// Get processor name for logs
    fn name(&self) -> &str {
        "JobProcessor"
    }
}

#[async_trait]
impl<P: JobProcessor + ?Sized> JobProcessor for Arc<P> {
    async fn process(&self, event: &Event) -> JobResult {
        (**self).process(event).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Looks up the handler for an event and runs it
///
/// Invalid events and unknown names fail as ordinary errors; the handler
/// is only called for a valid event with a registered name.
#[derive(Debug, Clone)]
pub struct TaskProcessor {
    registry: Arc<TaskRegistry>,
}

impl TaskProcessor {
    /// Run tasks from `registry`
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// Registry handlers are looked up in
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }
}

#[async_trait]
impl JobProcessor for TaskProcessor {
    async fn process(&self, event: &Event) -> JobResult {
        if !event.valid {
            return Err(JobError::InvalidEvent);
        }
        if event.name.is_empty() {
            return Err(JobError::EmptyName);
        }

        let handler = self
            .registry
            .get(&event.name)
            .ok_or_else(|| JobError::TaskNotFound {
                name: event.name.clone(),
            })?;

        handler.run(event).await.map_err(JobError::Task)
    }

    fn name(&self) -> &str {
        "TaskProcessor"
    }
}
