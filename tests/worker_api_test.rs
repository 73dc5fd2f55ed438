//! The `Worker` entry point with real stores and observers

mod common;

use common::{wait_until, RecordingLogger};
use pretty_assertions::assert_eq;
use queue_worker::connector::{LocalConnector, MemoryBroker};
use queue_worker::consumer::ConsumerError;
use queue_worker::metrics::InMemoryMetrics;
use queue_worker::store::{JsonFileStore, MemoryStore};
use queue_worker::{task_fn, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_observer_receives_parsed_events() {
    let broker = MemoryBroker::new();
    let worker = Worker::builder()
        .connector(LocalConnector::new(broker.clone(), Arc::new(MemoryStore::new())))
        .task("greet", task_fn(|event| {
            event.get_string("who")?;
            Ok(())
        }))
        .build()
        .unwrap();

    broker.publish("inbox", "inbox.key", r#"{"event": "greet", "who": "ada"}"#);
    broker.publish("inbox", "inbox.key", "garbage");

    let (observer, mut observed) = mpsc::channel(8);
    let handle = tokio::spawn(async move {
        worker
            .consume("inbox", "greeter", "inbox.key", 2, Some(observer))
            .await
    });

    let first = tokio::time::timeout(Duration::from_secs(5), observed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.valid);
    assert_eq!(first.name, "greet");
    assert_eq!(first.get_string("who").unwrap(), "ada");

    let second = tokio::time::timeout(Duration::from_secs(5), observed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!second.valid);
    assert!(second.fields.is_empty());

    wait_until("2 acks", || broker.ack_count() == 2).await;
    // the observer copy shares the ack handle with the processed event
    assert!(first.original_message.is_acknowledged());
    assert!(matches!(
        first.original_message.ack().await,
        Err(ConsumerError::AlreadyAcknowledged(_))
    ));
    assert_eq!(broker.ack_count(), 2);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dead_letters_written_to_files() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let metrics = InMemoryMetrics::new();
    let worker = Worker::builder()
        .connector(LocalConnector::new(
            broker.clone(),
            Arc::new(JsonFileStore::new(dir.path())),
        ))
        .task("charge", task_fn(|_| anyhow::bail!("card declined")))
        .metrics(metrics.clone())
        .metrics_prefix("payments")
        .logger(RecordingLogger::default())
        .build()
        .unwrap();

    broker.publish("charges", "charges.new", r#"{"event": "charge", "card.last4": "4242"}"#);
    let handle = tokio::spawn(async move {
        worker
            .consume("charges", "payments", "charges.new", 1, None)
            .await
    });

    wait_until("dead letter counted", || {
        metrics.counter_value("payments.worker.dead_letter.written") == 1
    })
    .await;

    let path = dir.path().join("failed_queue").join("payments_failed_queue.jsonl");
    let content = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);

    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["error_message"], "card declined");
    assert_eq!(record["routing_key"], "charges.new");
    assert_eq!(record["message"]["card_last4"], "4242");
    assert!(record["error_backtrace"].as_str().unwrap().contains("card declined"));

    assert_eq!(metrics.counter_value("payments.worker.status.failed"), 1);
    assert_eq!(
        metrics.counter_value("payments.worker.types.charge.status.failed"),
        1
    );
    assert_eq!(broker.ack_count(), 1);

    handle.abort();
}

#[tokio::test]
async fn test_consume_rejects_zero_pool() {
    let worker = Worker::builder()
        .connector(LocalConnector::new(MemoryBroker::new(), Arc::new(MemoryStore::new())))
        .task("noop", task_fn(|_| Ok(())))
        .build()
        .unwrap();

    let err = worker.consume("q", "w", "", 0, None).await.unwrap_err();
    assert!(matches!(err, ConsumerError::Precondition(_)));
}
