//! End-to-end consumption over the in-memory broker

mod common;

use async_trait::async_trait;
use common::{config, wait_until, Harness};
use pretty_assertions::assert_eq;
use queue_worker::consumer::{ConsumerConfig, ConsumerError, ReconnectPolicy, SupervisorState};
use queue_worker::registry::{task_fn, TaskHandler, TaskResult};
use queue_worker::{Event, TaskRegistry};
use rstest::rstest;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn noop_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("noop", task_fn(|_| Ok(())));
    registry
}

struct PanickingTask;

#[async_trait]
impl TaskHandler for PanickingTask {
    async fn run(&self, event: &Event) -> TaskResult {
        panic!("cannot handle {}", event.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_message_acked_without_dead_letters() {
    let harness = Harness::new();
    for i in 0..10 {
        harness.publish_json("jobs", "jobs.key", json!({"event": "noop", "seq": i}));
    }

    let supervisor = harness.supervisor(config("jobs", "runner", 2), noop_registry());
    let handle = tokio::spawn(async move { supervisor.run().await });

    wait_until("10 acks", || harness.broker.ack_count() == 10).await;
    wait_until("10 metric samples", || {
        harness.metrics.counter_value("worker.total_requests") == 10
    })
    .await;

    assert_eq!(harness.store.total(), 0);
    assert_eq!(harness.broker.pending("jobs"), 0);
    assert_eq!(harness.metrics.counter_value("worker.status.success"), 10);
    assert_eq!(harness.metrics.counter_value("worker.types.noop.total_requests"), 10);
    assert_eq!(harness.metrics.timing_count("worker.response_time"), 10);

    let mut tags = harness.broker.acked_tags();
    tags.sort_unstable();
    tags.dedup();
    assert_eq!(tags.len(), 10);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_event_is_acked_and_dead_lettered() {
    let harness = Harness::new();
    harness.publish_json("jobs", "jobs.key", json!({"event": "x", "payload.id": 3}));

    let supervisor = harness.supervisor(config("jobs", "runner", 2), noop_registry());
    let handle = tokio::spawn(async move { supervisor.run().await });

    wait_until("dead letter", || harness.store.total() == 1).await;
    assert_eq!(harness.broker.ack_count(), 1);

    let records = harness.dead_letters("runner");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(record["error_message"].as_str().unwrap().contains("couldn't find task"));
    assert!(record["error_message"].as_str().unwrap().contains("`x`"));
    assert_eq!(record["message"]["payload_id"], json!(3));
    assert_eq!(record["routing_key"], json!("jobs.key"));
    assert_eq!(harness.logger.fatal_count(), 0);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_handler_is_recovered() {
    let harness = Harness::new();
    let mut registry = noop_registry();
    registry.register("explode", PanickingTask);

    harness.publish_json("jobs", "jobs.key", json!({"event": "explode"}));
    let supervisor = harness.supervisor(config("jobs", "runner", 1), registry);
    let handle = tokio::spawn(async move { supervisor.run().await });

    wait_until("dead letter", || harness.store.total() == 1).await;
    assert_eq!(harness.broker.ack_count(), 1);
    assert_eq!(harness.logger.fatal_count(), 1);
    assert_eq!(harness.logger.fatals_containing("cannot handle explode"), 1);

    // the single worker survived the panic
    harness.publish_json("jobs", "jobs.key", json!({"event": "noop"}));
    wait_until("second ack", || harness.broker.ack_count() == 2).await;
    assert_eq!(harness.store.total(), 1);

    let record = &harness.dead_letters("runner")[0];
    assert!(record["error_message"].as_str().unwrap().contains("panicked"));

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_record_uses_configured_routing_key() {
    let harness = Harness::new();
    let mut registry = noop_registry();
    registry.register("reject", task_fn(|_| anyhow::bail!("rejected by handler")));

    harness.publish_json("jobs", "broker.side.key", json!({"event": "reject"}));
    harness.publish_json("jobs", "broker.side.key", json!({"event": "noop"}));

    let config = ConsumerConfig::builder()
        .queue_name("jobs")
        .worker_name("billing")
        .routing_key("configured.key")
        .pool_size(2)
        .build();
    let supervisor = harness.supervisor(config, registry);
    let handle = tokio::spawn(async move { supervisor.run().await });

    wait_until("2 acks", || harness.broker.ack_count() == 2).await;
    wait_until("dead letter", || harness.store.total() == 1).await;

    let records = harness.dead_letters("billing");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["routing_key"], json!("configured.key"));
    assert_eq!(records[0]["error_message"], json!("rejected by handler"));
    assert!(records[0]["created_at"].is_string());

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_bodies_are_dead_lettered() {
    let harness = Harness::new();
    harness.broker.publish("jobs", "jobs.key", "not json at all");
    harness.broker.publish("jobs", "jobs.key", r#"{"event": 7, "order.id": 1}"#);

    let supervisor = harness.supervisor(config("jobs", "runner", 2), noop_registry());
    let handle = tokio::spawn(async move { supervisor.run().await });

    wait_until("2 dead letters", || harness.store.total() == 2).await;
    assert_eq!(harness.broker.ack_count(), 2);
    assert!(harness.logger.errors_containing("failed to parse message") >= 2);

    let records = harness.dead_letters("runner");
    let mut messages: Vec<serde_json::Value> =
        records.iter().map(|r| r["message"].clone()).collect();
    messages.sort_by_key(|m| m.as_object().map(|o| o.len()).unwrap_or(0));
    assert_eq!(messages[0], json!({}));
    assert_eq!(messages[1], json!({"event": 7, "order_id": 1}));
    assert!(records
        .iter()
        .all(|r| r["error_message"] == json!("event is not valid")));

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broken_text_still_reaches_handler() {
    let harness = Harness::new();
    let notes = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = notes.clone();
    let mut registry = TaskRegistry::new();
    registry.register(
        "noop",
        task_fn(move |event| {
            seen.lock().push(event.get_string("note")?.to_string());
            Ok(())
        }),
    );

    harness
        .broker
        .publish("jobs", "jobs.key", &b"{\"event\":\"noop\",\"note\":\"caf\xe9\"}"[..]);
    harness.broker.publish(
        "jobs",
        "jobs.key",
        r#"{"event":"noop","order_id":42,"note":"x\ud800y"}"#,
    );

    let supervisor = harness.supervisor(config("jobs", "runner", 1), registry);
    let handle = tokio::spawn(async move { supervisor.run().await });

    wait_until("2 acks", || harness.broker.ack_count() == 2).await;
    wait_until("2 successes", || {
        harness.metrics.counter_value("worker.status.success") == 2
    })
    .await;

    assert_eq!(harness.store.total(), 0);
    assert_eq!(
        notes.lock().clone(),
        vec!["caf".to_string(), "x\u{fffd}y".to_string()]
    );

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnects_after_broken_stream() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let mut registry = TaskRegistry::new();
    registry.register(
        "count",
        task_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let supervisor = harness.supervisor(config("jobs", "runner", 2), registry);
    let mut states = supervisor.subscribe();
    let handle = tokio::spawn(async move { supervisor.run().await });

    states
        .wait_for(|state| *state == SupervisorState::Streaming)
        .await
        .unwrap();
    harness.publish_json("jobs", "jobs.key", json!({"event": "count"}));
    harness.publish_json("jobs", "jobs.key", json!({"event": "count"}));
    wait_until("first batch", || harness.broker.ack_count() == 2).await;

    harness.broker.disconnect();
    wait_until("reconnect", || harness.connector.channel_acquisitions() >= 2).await;

    harness.publish_json("jobs", "jobs.key", json!({"event": "count"}));
    harness.publish_json("jobs", "jobs.key", json!({"event": "count"}));
    wait_until("second batch", || harness.broker.ack_count() == 4).await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(harness.metrics.counter_value("worker.reconnects") >= 1);
    assert!(harness.logger.errors_containing("consumption stream for queue `jobs` closed") >= 1);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acquisition_failures_are_retried() {
    let harness = Harness::new();
    harness.connector.fail_next_acquisitions(3);
    harness.publish_json("jobs", "jobs.key", json!({"event": "noop"}));

    let config = ConsumerConfig::builder()
        .queue_name("jobs")
        .worker_name("runner")
        .pool_size(1)
        .reconnect(ReconnectPolicy::fixed(Duration::from_millis(5)))
        .build();
    let supervisor = harness.supervisor(config, noop_registry());
    let handle = tokio::spawn(async move { supervisor.run().await });

    wait_until("ack after retries", || harness.broker.ack_count() == 1).await;
    assert!(harness.connector.channel_acquisitions() >= 4);
    assert!(harness.logger.errors_containing("injected channel acquisition failure") >= 3);

    handle.abort();
}

#[rstest]
#[case::empty_queue(config("", "runner", 1))]
#[case::empty_worker(config("jobs", "", 1))]
#[case::zero_pool(config("jobs", "runner", 0))]
#[tokio::test]
async fn test_preconditions_return_without_connecting(#[case] config: ConsumerConfig) {
    let harness = Harness::new();
    let supervisor = harness.supervisor(config, noop_registry());

    let err = supervisor.run().await.unwrap_err();
    assert!(matches!(err, ConsumerError::Precondition(_)));
    assert_eq!(harness.connector.channel_acquisitions(), 0);
    assert_eq!(harness.logger.error_count(), 1);
}

#[tokio::test]
async fn test_empty_registry_returns_without_connecting() {
    let harness = Harness::new();
    let supervisor = harness.supervisor(config("jobs", "runner", 1), TaskRegistry::new());

    let err = supervisor.run().await.unwrap_err();
    assert_eq!(err.to_string(), "Precondition failed: No tasks registered");
    assert_eq!(harness.connector.channel_acquisitions(), 0);
}
