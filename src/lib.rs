//! Message-queue worker runtime
//!
//! This library consumes event messages from a broker queue, decodes them,
//! and dispatches each one to a registered task running on a fixed pool of
//! workers. Every message is acknowledged exactly once; messages whose task
//! fails (including tasks that panic) are written to a dead-letter store
//! for later inspection.
//!
//! # Example
//!
//! ```no_run
//! use queue_worker::connector::{LocalConnector, MemoryBroker};
//! use queue_worker::registry::task_fn;
//! use queue_worker::store::MemoryStore;
//! use queue_worker::Worker;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = MemoryBroker::new();
//! let worker = Worker::builder()
//!     .connector(LocalConnector::new(broker.clone(), Arc::new(MemoryStore::new())))
//!     .task("order_created", task_fn(|event| {
//!         let order_id = event.get_int("order_id")?;
//!         tracing::info!(order_id, "order received");
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! broker.publish("orders", "orders.created", r#"{"event": "order_created", "order_id": 7}"#);
//! worker.consume("orders", "billing", "orders.created", 4, None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

// Re-export commonly used items
pub use consumer::{ConsumerConfig, ConsumerError, ConsumerResult, ConsumerSupervisor, JobError};
pub use error::{Error, Result};
pub use event::{Event, EventBuilder, Fields, Value};
pub use parser::{EventParser, ParseError};
pub use registry::{task_fn, TaskHandler, TaskRegistry, TaskResult};

/// Broker and store collaborators
pub mod connector;

/// Consumer runtime: supervisor, pool, middleware, dead letters
pub mod consumer;

/// Error types
pub mod error;

/// Event abstractions
pub mod event;

/// Error logging
pub mod logger;

/// Counters and timings
pub mod metrics;

/// Message body decoding
pub mod parser;

/// Task handlers by event name
pub mod registry;

/// Settings file for the binary
pub mod settings;

/// Document stores
pub mod store;

use crate::connector::Connector;
use crate::consumer::ReconnectPolicy;
use crate::logger::{Logger, TracingLogger};
use crate::metrics::{Metrics, NoopMetrics, Prefixed};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Builder for configuring a [`Worker`]
pub struct WorkerBuilder {
    connector: Option<Arc<dyn Connector>>,
    registry: TaskRegistry,
    logger: Option<Arc<dyn Logger>>,
    metrics: Option<Arc<dyn Metrics>>,
    metrics_prefix: Option<String>,
    reconnect: ReconnectPolicy,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            connector: None,
            registry: TaskRegistry::new(),
            logger: None,
            metrics: None,
            metrics_prefix: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Set the broker and store connector
    pub fn connector(self, connector: impl Connector) -> Self {
        self.connector_arc(Arc::new(connector))
    }

    /// Set an already shared connector
    pub fn connector_arc(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Register a task; a duplicate name keeps the first handler
    pub fn task<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        if !self.registry.register(name.clone(), handler) {
            warn!("Task `{}` is already registered, keeping the first one", name);
        }
        self
    }

    /// Replace the registry
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the error logger (default: [`TracingLogger`])
    pub fn logger(mut self, logger: impl Logger) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Set the metrics sink (default: [`NoopMetrics`])
    pub fn metrics(mut self, metrics: impl Metrics) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    /// Prefix every metric name
    pub fn metrics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metrics_prefix = Some(prefix.into());
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Build the worker
    pub fn build(self) -> Result<Worker> {
        let connector = self
            .connector
            .ok_or_else(|| Error::config("A connector is required"))?;
        self.reconnect.validate().map_err(Error::Config)?;

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(NoopMetrics) as Arc<dyn Metrics>);
        let metrics: Arc<dyn Metrics> = match self.metrics_prefix {
            Some(prefix) if !prefix.is_empty() => Arc::new(Prefixed::new(prefix, metrics)),
            _ => metrics,
        };

        Ok(Worker {
            connector,
            registry: Arc::new(self.registry),
            logger: self
                .logger
                .unwrap_or_else(|| Arc::new(TracingLogger::default()) as Arc<dyn Logger>),
            metrics,
            reconnect: self.reconnect,
        })
    }
}

/// Collaborators and tasks, ready to consume queues
#[derive(Clone)]
pub struct Worker {
    connector: Arc<dyn Connector>,
    registry: Arc<TaskRegistry>,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn Metrics>,
    reconnect: ReconnectPolicy,
}

impl Worker {
    /// Create a builder
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    /// Registered tasks
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Build a supervisor for `config` without starting it
    pub fn supervisor(&self, config: ConsumerConfig) -> ConsumerSupervisor {
        ConsumerSupervisor::new(
            config,
            self.connector.clone(),
            self.registry.clone(),
            self.logger.clone(),
            self.metrics.clone(),
        )
    }

    /// Consume `queue_name` with `pool_size` workers
    ///
    /// Failed jobs are dead-lettered into `<worker_name>_failed_queue` with
    /// `routing_key`. A copy of every parsed event goes to `observer` when
    /// one is given. Runs until the process stops; returns only when a
    /// startup precondition fails.
    pub async fn consume(
        &self,
        queue_name: &str,
        worker_name: &str,
        routing_key: &str,
        pool_size: usize,
        observer: Option<mpsc::Sender<Event>>,
    ) -> ConsumerResult<()> {
        let config = ConsumerConfig::builder()
            .queue_name(queue_name)
            .worker_name(worker_name)
            .routing_key(routing_key)
            .pool_size(pool_size)
            .reconnect(self.reconnect.clone())
            .build();

        let mut supervisor = self.supervisor(config);
        if let Some(observer) = observer {
            supervisor = supervisor.with_observer(observer);
        }
        supervisor.run().await
    }
}
