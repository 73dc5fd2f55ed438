//! Processing stages wrapped around every job
//!
//! [`MiddlewareChain`] builds the fixed stack used by the worker pool:
//! metrics on the outside, panic recovery inside it, then the task
//! itself. Metrics therefore observe recovered panics as ordinary
//! failures.

use crate::consumer::error::JobError;
use crate::consumer::processor::{JobProcessor, JobResult, TaskProcessor};
use crate::event::Event;
use crate::logger::Logger;
use crate::metrics::Metrics;
use crate::registry::TaskRegistry;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Turns handler panics into [`JobError::Panicked`] and logs every failure
pub struct RecoveryProcessor<P: JobProcessor> {
    inner: P,
    logger: Arc<dyn Logger>,
}

impl<P: JobProcessor> RecoveryProcessor<P> {
    /// Wrap `processor`, reporting failures to `logger`
    pub fn new(processor: P, logger: Arc<dyn Logger>) -> Self {
        Self {
            inner: processor,
            logger,
        }
    }
}

#[async_trait]
impl<P: JobProcessor> JobProcessor for RecoveryProcessor<P> {
    async fn process(&self, event: &Event) -> JobResult {
        let result = match AssertUnwindSafe(self.inner.process(event))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(JobError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        };

        match &result {
            Ok(()) => {}
            Err(JobError::Task(err)) => self.logger.log_error(err),
            Err(err) if err.is_fault() => self.logger.log_fatal(&anyhow::anyhow!("{}", err)),
            Err(err) => self.logger.log_error(&anyhow::anyhow!("{}", err)),
        }

        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Per-event bucket for names no task is registered under
pub const UNKNOWN_TYPE_BUCKET: &str = "unknown";

/// Wrapper for adding metrics to any processor
pub struct MetricsProcessor<P: JobProcessor> {
    inner: P,
    metrics: Arc<dyn Metrics>,
    known_tasks: Option<Arc<TaskRegistry>>,
}

impl<P: JobProcessor> MetricsProcessor<P> {
    /// Wrap `processor`, recording every job in `metrics`
    pub fn new(processor: P, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            inner: processor,
            metrics,
            known_tasks: None,
        }
    }

    /// Only names registered in `registry` get their own per-event
    /// bucket; every other name is counted under [`UNKNOWN_TYPE_BUCKET`]
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.known_tasks = Some(registry);
        self
    }

    fn type_bucket<'a>(&self, name: &'a str) -> &'a str {
        match &self.known_tasks {
            Some(registry) if !registry.contains(name) => UNKNOWN_TYPE_BUCKET,
            _ => name,
        }
    }
}

#[async_trait]
impl<P: JobProcessor> JobProcessor for MetricsProcessor<P> {
    async fn process(&self, event: &Event) -> JobResult {
        let start = Instant::now();
        let result = self.inner.process(event).await;
        let duration = start.elapsed();

        let status = if result.is_ok() { "success" } else { "failed" };

        self.metrics.counter("worker.total_requests", 1);
        self.metrics.counter(&format!("worker.status.{}", status), 1);
        self.metrics.timing("worker.response_time", duration);

        if !event.name.is_empty() {
            let prefix = format!("worker.types.{}", self.type_bucket(&event.name));
            self.metrics.counter(&format!("{}.total_requests", prefix), 1);
            self.metrics.counter(&format!("{}.status.{}", prefix, status), 1);
            self.metrics.timing(&format!("{}.response_time", prefix), duration);
        }

        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// The stage stack every job runs through
pub type MiddlewareStack = MetricsProcessor<RecoveryProcessor<TaskProcessor>>;

/// Builds the middleware stack for a registry
pub struct MiddlewareChain;

impl MiddlewareChain {
    /// Metrics (outer), then Recovery, then the registered task
    pub fn build(
        registry: Arc<TaskRegistry>,
        logger: Arc<dyn Logger>,
        metrics: Arc<dyn Metrics>,
    ) -> MiddlewareStack {
        let task = TaskProcessor::new(registry.clone());
        MetricsProcessor::new(RecoveryProcessor::new(task, logger), metrics).with_registry(registry)
    }
}
