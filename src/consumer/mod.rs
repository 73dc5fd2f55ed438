//! Queue consumer runtime
//!
//! This module provides the pieces that turn a broker queue into handler
//! calls:
//! - A supervisor that connects, consumes and reconnects forever
//! - A fixed worker pool fed through a bounded dispatch queue
//! - Panic recovery and metrics around every job
//! - A dead-letter store for jobs that failed
//!
//! Every consumed message is acknowledged exactly once, whatever the
//! outcome of its job.
//!
//! # Example
//!
//! ```no_run
//! use queue_worker::connector::{LocalConnector, MemoryBroker};
//! use queue_worker::consumer::{ConsumerConfig, ConsumerSupervisor};
//! use queue_worker::logger::TracingLogger;
//! use queue_worker::metrics::NoopMetrics;
//! use queue_worker::registry::{task_fn, TaskRegistry};
//! use queue_worker::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut registry = TaskRegistry::new();
//! registry.register("signup", task_fn(|event| {
//!     let email = event.get_string("email")?;
//!     tracing::info!("welcome {}", email);
//!     Ok(())
//! }));
//!
//! let config = ConsumerConfig::builder()
//!     .queue_name("events")
//!     .worker_name("mailer")
//!     .routing_key("events.signup")
//!     .pool_size(4)
//!     .build();
//!
//! let connector = LocalConnector::new(MemoryBroker::new(), Arc::new(MemoryStore::new()));
//! let supervisor = ConsumerSupervisor::new(
//!     config,
//!     Arc::new(connector),
//!     Arc::new(registry),
//!     Arc::new(TracingLogger::default()),
//!     Arc::new(NoopMetrics),
//! );
//! supervisor.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dlq;
pub mod error;
pub mod middleware;
pub mod pool;
pub mod processor;
pub mod retry;
pub mod sanitize;
pub mod supervisor;

pub use config::{ConsumerConfig, ConsumerConfigBuilder};
pub use dlq::{DeadLetterRecord, DeadLetterSink, FAILED_QUEUE_STORE};
pub use error::{ConsumerError, ConsumerResult, JobError};
pub use middleware::{MetricsProcessor, MiddlewareChain, MiddlewareStack, RecoveryProcessor};
pub use pool::{WorkerContext, WorkerPool};
pub use processor::{JobProcessor, JobResult, TaskProcessor};
pub use retry::ReconnectPolicy;
pub use sanitize::{repair_escapes, repair_text, sanitize_fields, sanitize_key};
pub use supervisor::{ConsumerSupervisor, SupervisorState};
