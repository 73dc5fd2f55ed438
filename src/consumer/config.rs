//! Consumer configuration structures

use crate::consumer::retry::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// What to consume and how many workers to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Broker queue to consume from
    pub queue_name: String,

    /// Worker identity; names the dead-letter collection
    pub worker_name: String,

    /// Routing key stamped on dead-letter records
    pub routing_key: String,

    /// Number of concurrent workers
    pub pool_size: usize,

    /// Reconnect pacing
    pub reconnect: ReconnectPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            worker_name: String::new(),
            routing_key: String::new(),
            pool_size: num_cpus::get(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the queue to consume
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.config.queue_name = queue_name.into();
        self
    }

    /// Set the worker name
    pub fn worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.config.worker_name = worker_name.into();
        self
    }

    /// Set the routing key stamped on dead letters
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.config.routing_key = routing_key.into();
        self
    }

    /// Set the number of workers
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Name of the dead-letter collection for this worker
    pub fn failed_collection(&self) -> String {
        format!("{}_failed_queue", self.worker_name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_name.is_empty() {
            return Err("Queue name cannot be empty".to_string());
        }

        if self.worker_name.is_empty() {
            return Err("Worker name cannot be empty".to_string());
        }

        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }

        self.reconnect.validate()
    }
}
