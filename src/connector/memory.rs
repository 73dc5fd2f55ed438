//! In-process broker used by tests and by the stdin-fed binary

use super::{Acker, BrokerChannel, Connector, Delivery, DeliveryStream, StoreSession};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::store::DocumentStore;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

struct Pending {
    body: Bytes,
    routing_key: String,
}

#[derive(Default)]
struct BrokerInner {
    queues: Mutex<HashMap<String, VecDeque<Pending>>>,
    notify: Notify,
    /// Bumped on every disconnect; open streams end when it changes
    generation: AtomicU64,
    next_tag: AtomicU64,
    acked: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

/// Named in-memory queues with competing-consumer streams
///
/// Messages handed to a stream are not redelivered if that stream breaks
/// before acknowledging them.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to a queue
    pub fn publish(&self, queue: &str, routing_key: &str, body: impl Into<Bytes>) {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(Pending {
                body: body.into(),
                routing_key: routing_key.to_string(),
            });
        self.inner.notify.notify_waiters();
    }

    /// Number of messages waiting in a queue
    pub fn pending(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Number of acknowledgments received
    pub fn ack_count(&self) -> usize {
        self.inner.acked.lock().len()
    }

    /// Delivery tags acknowledged so far, in acknowledgment order
    pub fn acked_tags(&self) -> Vec<u64> {
        self.inner.acked.lock().clone()
    }

    /// Break every open consumption stream, as a dropped connection would
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Break open streams and refuse new channels
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.disconnect();
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn stream(&self, queue: String) -> DeliveryStream {
        let inner = self.inner.clone();
        let acker: Arc<dyn Acker> = Arc::new(MemoryAcker {
            inner: self.inner.clone(),
        });
        let generation = inner.generation.load(Ordering::SeqCst);

        Box::pin(async_stream::stream! {
            loop {
                // Registered before the checks so a publish in between is not missed
                let notified = inner.notify.notified();
                if inner.generation.load(Ordering::SeqCst) != generation {
                    debug!(queue = %queue, "memory stream broken by disconnect");
                    break;
                }
                let next = inner.queues.lock().get_mut(&queue).and_then(VecDeque::pop_front);
                match next {
                    Some(pending) => {
                        drop(notified);
                        let tag = inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                        yield Delivery::new(pending.body, pending.routing_key, tag, acker.clone());
                    }
                    None => notified.await,
                }
            }
        })
    }
}

struct MemoryAcker {
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> ConsumerResult<()> {
        self.inner.acked.lock().push(delivery_tag);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn consume(&self, queue: &str, consumer_tag: &str) -> ConsumerResult<DeliveryStream> {
        if self.broker.is_closed() {
            return Err(ConsumerError::Consume("broker is closed".to_string()));
        }
        debug!(queue, consumer_tag, "opening memory consumption stream");
        Ok(self.broker.stream(queue.to_string()))
    }
}

/// Connector over a [`MemoryBroker`] and any [`DocumentStore`]
#[derive(Clone)]
pub struct LocalConnector {
    broker: MemoryBroker,
    store: Arc<dyn DocumentStore>,
    acquisitions: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl LocalConnector {
    /// Create a connector
    pub fn new(broker: MemoryBroker, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            broker,
            store,
            acquisitions: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` channel acquisitions fail
    pub fn fail_next_acquisitions(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of channel acquisitions attempted so far
    pub fn channel_acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// The broker behind this connector
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn acquire_broker_channel(&self) -> ConsumerResult<Box<dyn BrokerChannel>> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConsumerError::Connection(
                "injected channel acquisition failure".to_string(),
            ));
        }
        if self.broker.is_closed() {
            return Err(ConsumerError::Connection("broker is closed".to_string()));
        }
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
        }))
    }

    async fn acquire_named_store(&self, name: &str) -> ConsumerResult<Box<dyn StoreSession>> {
        self.store.open_session(name).await
    }
}
