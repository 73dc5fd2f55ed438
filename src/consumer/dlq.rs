//! Dead-letter store for messages whose job failed

use crate::connector::{Connector, Delivery, Document};
use crate::consumer::error::{ConsumerError, ConsumerResult, JobError};
use crate::consumer::sanitize::sanitize_fields;
use crate::event::Fields;
use crate::logger::Logger;
use crate::metrics::Metrics;
use crate::parser::EventParser;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Named store that receives dead letters
pub const FAILED_QUEUE_STORE: &str = "failed_queue";

/// One failed message as it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Sanitized fields of the original message
    pub message: Fields,
    /// Routing key the worker is configured with
    pub routing_key: String,
    /// Short failure description
    pub error_message: String,
    /// Full failure detail
    pub error_backtrace: String,
    /// When the record was built
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Convert into a store document
    pub fn to_document(&self) -> ConsumerResult<Document> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(document) => Ok(document),
            other => Err(ConsumerError::Serialization(format!(
                "dead letter record serialized to {}, expected an object",
                other
            ))),
        }
    }
}

/// Persists failed messages into `<worker_name>_failed_queue`
#[derive(Clone)]
pub struct DeadLetterSink {
    connector: Arc<dyn Connector>,
    parser: EventParser,
    collection: String,
    routing_key: String,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn Metrics>,
}

impl DeadLetterSink {
    /// Create a sink for `worker_name`
    pub fn new(
        connector: Arc<dyn Connector>,
        worker_name: &str,
        routing_key: impl Into<String>,
        logger: Arc<dyn Logger>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            connector,
            parser: EventParser::new(),
            collection: format!("{}_failed_queue", worker_name),
            routing_key: routing_key.into(),
            logger,
            metrics,
        }
    }

    /// Collection records are written to
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Build the record for a failed delivery
    pub fn record(&self, delivery: &Delivery, err: &JobError) -> DeadLetterRecord {
        DeadLetterRecord {
            message: sanitize_fields(
                self.parser
                    .decode_fields(delivery.body())
                    .unwrap_or_default(),
            ),
            routing_key: self.routing_key.clone(),
            error_message: err.error_message(),
            error_backtrace: err.error_backtrace(),
            created_at: Utc::now(),
        }
    }

    /// Write the record for a failed delivery, logging and counting
    /// failures instead of returning them
    pub async fn send(&self, delivery: &Delivery, err: &JobError) {
        match self.try_send(delivery, err).await {
            Ok(()) => {
                self.metrics.counter("worker.dead_letter.written", 1);
                debug!(
                    collection = %self.collection,
                    delivery_tag = delivery.delivery_tag(),
                    "Message written to dead letter store"
                );
            }
            Err(write_err) => {
                self.metrics.counter("worker.dead_letter.failed", 1);
                self.logger.log_error(
                    &anyhow::Error::new(write_err).context(format!(
                        "failed to write message {} to {}",
                        delivery.delivery_tag(),
                        self.collection
                    )),
                );
            }
        }
    }

    /// Write the record for a failed delivery
    pub async fn try_send(&self, delivery: &Delivery, err: &JobError) -> ConsumerResult<()> {
        let document = self.record(delivery, err).to_document()?;

        let mut session = self.connector.acquire_named_store(FAILED_QUEUE_STORE).await?;
        let inserted = session.insert(&self.collection, document).await;
        let closed = session.close().await;

        inserted?;
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{LocalConnector, MemoryBroker};
    use crate::event::Value;
    use crate::logger::TracingLogger;
    use crate::metrics::InMemoryMetrics;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn sink(store: &MemoryStore, metrics: &InMemoryMetrics) -> DeadLetterSink {
        let connector = LocalConnector::new(MemoryBroker::new(), Arc::new(store.clone()));
        DeadLetterSink::new(
            Arc::new(connector),
            "billing",
            "orders.created",
            Arc::new(TracingLogger::default()),
            Arc::new(metrics.clone()),
        )
    }

    fn failure() -> JobError {
        JobError::TaskNotFound {
            name: "x".to_string(),
        }
    }

    #[tokio::test]
    async fn test_record_is_sanitized_and_stored() {
        let store = MemoryStore::new();
        let metrics = InMemoryMetrics::new();
        let sink = sink(&store, &metrics);

        let delivery = Delivery::detached(
            Bytes::from_static(br#"{"event": "x", "user.id": 7, "meta": {"a.b": true}}"#),
            "ignored.key",
        );
        sink.send(&delivery, &failure()).await;

        let documents = store.documents(FAILED_QUEUE_STORE, "billing_failed_queue");
        assert_eq!(documents.len(), 1);
        assert_eq!(metrics.counter_value("worker.dead_letter.written"), 1);
        assert_eq!(store.open_sessions(), 0);

        let record: DeadLetterRecord =
            serde_json::from_value(serde_json::Value::Object(documents[0].clone())).unwrap();
        assert_eq!(record.routing_key, "orders.created");
        assert_eq!(record.message.get("user_id"), Some(&Value::Integer(7)));
        assert!(record.message["meta"].as_object().unwrap().contains_key("a_b"));
        assert!(record.error_message.contains("couldn't find task for event `x`"));
    }

    #[tokio::test]
    async fn test_document_keys() {
        let store = MemoryStore::new();
        let sink = sink(&store, &InMemoryMetrics::new());
        let record = sink.record(&Delivery::detached(Bytes::from_static(b"{}"), ""), &failure());

        let mut keys: Vec<String> = record.to_document().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["created_at", "error_backtrace", "error_message", "message", "routing_key"]
        );
    }

    #[test]
    fn test_invalid_utf8_body_is_repaired() {
        let store = MemoryStore::new();
        let sink = sink(&store, &InMemoryMetrics::new());
        let delivery = Delivery::detached(
            Bytes::from_static(b"{\"event\": \"x\", \"name\": \"b\xffob\"}"),
            "",
        );

        let record = sink.record(&delivery, &failure());
        assert_eq!(record.message.get("name"), Some(&Value::String("bob".to_string())));
    }

    #[test]
    fn test_lone_surrogate_keeps_payload() {
        let store = MemoryStore::new();
        let sink = sink(&store, &InMemoryMetrics::new());
        let delivery = Delivery::detached(
            Bytes::from_static(br#"{"event": "x", "order_id": 42, "note": "x\ud800y"}"#),
            "",
        );

        let record = sink.record(&delivery, &failure());
        assert_eq!(record.message.get("order_id"), Some(&Value::Integer(42)));
        assert_eq!(
            record.message.get("note"),
            Some(&Value::String("x\u{fffd}y".to_string()))
        );
    }

    #[test]
    fn test_undecodable_body_gives_empty_message() {
        let store = MemoryStore::new();
        let sink = sink(&store, &InMemoryMetrics::new());
        let record = sink.record(&Delivery::detached(Bytes::from_static(b"not json"), ""), &failure());
        assert!(record.message.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_counted() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let metrics = InMemoryMetrics::new();
        let sink = sink(&store, &metrics);

        let delivery = Delivery::detached(Bytes::from_static(b"{}"), "");
        assert!(sink.try_send(&delivery, &failure()).await.is_err());
        sink.send(&delivery, &failure()).await;

        assert_eq!(store.total(), 0);
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(metrics.counter_value("worker.dead_letter.failed"), 1);
    }
}
