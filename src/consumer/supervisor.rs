//! Connect, consume, reconnect

use crate::connector::Connector;
use crate::consumer::config::ConsumerConfig;
use crate::consumer::dlq::DeadLetterSink;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::middleware::MiddlewareChain;
use crate::consumer::pool::{WorkerContext, WorkerPool};
use crate::event::Event;
use crate::logger::{host_name, Logger};
use crate::metrics::Metrics;
use crate::parser::EventParser;
use crate::registry::TaskRegistry;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Connection state of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No channel; about to connect or waiting to reconnect
    Disconnected,
    /// Acquiring a channel and opening the stream
    Connecting,
    /// Receiving deliveries
    Streaming,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Keeps one queue consumed for as long as it runs
///
/// Each connection spawns a fresh [`WorkerPool`]. When the stream ends the
/// pool is drained and the supervisor reconnects, pacing attempts with the
/// configured [`ReconnectPolicy`](crate::consumer::ReconnectPolicy). Only a
/// failed startup precondition makes [`run`](Self::run) return.
pub struct ConsumerSupervisor {
    config: ConsumerConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<TaskRegistry>,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn Metrics>,
    parser: EventParser,
    observer: Option<mpsc::Sender<Event>>,
    state: watch::Sender<SupervisorState>,
}

impl ConsumerSupervisor {
    /// Create a supervisor; nothing connects until [`run`](Self::run)
    pub fn new(
        config: ConsumerConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<TaskRegistry>,
        logger: Arc<dyn Logger>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            config,
            connector,
            registry,
            logger,
            metrics,
            parser: EventParser::new(),
            observer: None,
            state,
        }
    }

    /// Send a copy of every parsed event to `observer`
    pub fn with_observer(mut self, observer: mpsc::Sender<Event>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use a custom parser
    pub fn with_parser(mut self, parser: EventParser) -> Self {
        self.parser = parser;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Consumer tag announced to the broker
    pub fn consumer_tag(&self) -> String {
        format!("{}-{}-consumer", host_name(), self.config.queue_name)
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                queue = %self.config.queue_name,
                from = %previous,
                to = %next,
                "Consumer state changed"
            );
        }
    }

    fn check_preconditions(&self) -> ConsumerResult<()> {
        let problem = match self.config.validate() {
            Err(problem) => Some(problem),
            Ok(()) if self.registry.is_empty() => Some("No tasks registered".to_string()),
            Ok(()) => None,
        };

        match problem {
            Some(problem) => {
                self.logger
                    .log_error(&anyhow::anyhow!("cannot start consumer: {}", problem));
                Err(ConsumerError::Precondition(problem))
            }
            None => Ok(()),
        }
    }

    fn worker_context(&self) -> Arc<WorkerContext> {
        let stack = MiddlewareChain::build(
            self.registry.clone(),
            self.logger.clone(),
            self.metrics.clone(),
        );
        let dead_letters = DeadLetterSink::new(
            self.connector.clone(),
            &self.config.worker_name,
            self.config.routing_key.clone(),
            self.logger.clone(),
            self.metrics.clone(),
        );
        Arc::new(WorkerContext::new(
            Arc::new(stack),
            dead_letters,
            self.logger.clone(),
        ))
    }

    /// Consume until the process stops
    ///
    /// Returns only when a startup precondition fails: empty queue or
    /// worker name, a zero pool size, or an empty registry.
    pub async fn run(&self) -> ConsumerResult<()> {
        self.check_preconditions()?;

        let consumer_tag = self.consumer_tag();
        let context = self.worker_context();
        let mut attempt: u32 = 0;

        info!(
            queue = %self.config.queue_name,
            worker = %self.config.worker_name,
            pool_size = self.config.pool_size,
            consumer_tag = %consumer_tag,
            "Starting consumer"
        );

        loop {
            self.transition(SupervisorState::Connecting);

            match self.stream_once(&consumer_tag, &context).await {
                Ok(()) => {
                    attempt = 0;
                    self.logger.log_error(&anyhow::anyhow!(
                        "consumption stream for queue `{}` closed",
                        self.config.queue_name
                    ));
                }
                Err(err) => {
                    self.logger.log_error(
                        &anyhow::Error::new(err)
                            .context(format!("consuming queue `{}` failed", self.config.queue_name)),
                    );
                }
            }

            self.transition(SupervisorState::Disconnected);
            self.metrics.counter("worker.reconnects", 1);

            attempt = attempt.saturating_add(1);
            let backoff = self.config.reconnect.next_backoff(attempt);
            if backoff.is_zero() {
                tokio::task::yield_now().await;
            } else {
                warn!("Reconnecting in {:?} (attempt {})", backoff, attempt);
                tokio::time::sleep(backoff).await;
            }
        }
    }

    /// One connection: acquire, stream until the stream ends, drain
    ///
    /// `Ok` means the stream was opened and later ended.
    pub async fn stream_once(
        &self,
        consumer_tag: &str,
        context: &Arc<WorkerContext>,
    ) -> ConsumerResult<()> {
        let channel = self.connector.acquire_broker_channel().await?;
        let mut deliveries = channel
            .consume(&self.config.queue_name, consumer_tag)
            .await?;

        self.transition(SupervisorState::Streaming);
        let pool = WorkerPool::spawn(self.config.pool_size, context.clone());

        let mut dispatch_error = None;
        while let Some(delivery) = deliveries.next().await {
            let (event, parse_error) = self.parser.parse(delivery);
            if let Some(err) = parse_error {
                self.logger.log_error(&anyhow::Error::new(err).context(format!(
                    "failed to parse message {}",
                    event.original_message.delivery_tag()
                )));
            }

            if let Some(observer) = &self.observer {
                if let Err(err) = observer.send(event.clone()).await {
                    debug!("Event observer is gone: {}", err);
                }
            }

            if let Err(err) = pool.dispatch(event).await {
                dispatch_error = Some(err);
                break;
            }
        }

        pool.drain().await;
        match dispatch_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
