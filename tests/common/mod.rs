//! Shared fixtures for the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use queue_worker::connector::{LocalConnector, MemoryBroker};
use queue_worker::consumer::{ConsumerConfig, ConsumerSupervisor};
use queue_worker::logger::Logger;
use queue_worker::metrics::InMemoryMetrics;
use queue_worker::store::MemoryStore;
use queue_worker::TaskRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Logger keeping every entry for assertions
#[derive(Default)]
pub struct RecordingLogger {
    pub errors: Mutex<Vec<String>>,
    pub fatals: Mutex<Vec<String>>,
}

impl RecordingLogger {
    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn fatal_count(&self) -> usize {
        self.fatals.lock().len()
    }

    pub fn errors_containing(&self, needle: &str) -> usize {
        self.errors.lock().iter().filter(|e| e.contains(needle)).count()
    }

    pub fn fatals_containing(&self, needle: &str) -> usize {
        self.fatals.lock().iter().filter(|e| e.contains(needle)).count()
    }
}

impl Logger for RecordingLogger {
    fn log_error(&self, err: &anyhow::Error) {
        self.errors.lock().push(format!("{:#}", err));
    }

    fn log_fatal(&self, err: &anyhow::Error) {
        self.fatals.lock().push(format!("{:#}", err));
    }
}

/// In-memory broker, store and sinks wired together
pub struct Harness {
    pub broker: MemoryBroker,
    pub store: MemoryStore,
    pub connector: LocalConnector,
    pub metrics: InMemoryMetrics,
    pub logger: Arc<RecordingLogger>,
}

impl Harness {
    pub fn new() -> Self {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let connector = LocalConnector::new(broker.clone(), Arc::new(store.clone()));
        Self {
            broker,
            store,
            connector,
            metrics: InMemoryMetrics::new(),
            logger: Arc::new(RecordingLogger::default()),
        }
    }

    pub fn supervisor(&self, config: ConsumerConfig, registry: TaskRegistry) -> ConsumerSupervisor {
        ConsumerSupervisor::new(
            config,
            Arc::new(self.connector.clone()),
            Arc::new(registry),
            self.logger.clone(),
            Arc::new(self.metrics.clone()),
        )
    }

    pub fn publish_json(&self, queue: &str, routing_key: &str, body: serde_json::Value) {
        self.broker.publish(queue, routing_key, body.to_string());
    }

    pub fn dead_letters(&self, worker_name: &str) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.store
            .documents("failed_queue", &format!("{}_failed_queue", worker_name))
    }
}

pub fn config(queue: &str, worker: &str, pool_size: usize) -> ConsumerConfig {
    ConsumerConfig::builder()
        .queue_name(queue)
        .worker_name(worker)
        .routing_key(format!("{}.key", queue))
        .pool_size(pool_size)
        .build()
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
