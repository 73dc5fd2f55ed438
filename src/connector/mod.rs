//! Broker and document-store collaborators
//!
//! The runtime never talks to a concrete broker or store. It asks a
//! [`Connector`] for a [`BrokerChannel`] to consume from and for named
//! [`StoreSession`]s to write dead letters into. Two connectors ship with
//! the crate:
//!
//! - [`memory::LocalConnector`]: an in-process queue, used by tests and by
//!   the stdin-fed binary
//! - `kafka::KafkaConnector` (feature `kafka`): an `rdkafka` stream consumer

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::{LocalConnector, MemoryBroker};

use crate::consumer::error::{ConsumerError, ConsumerResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stream of deliveries; the end of the stream means the channel broke
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Document persisted into a store collection
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Source of broker channels and store sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Acquire a channel to consume from
    async fn acquire_broker_channel(&self) -> ConsumerResult<Box<dyn BrokerChannel>>;

    /// Open a session on a named document store; the caller closes it
    async fn acquire_named_store(&self, name: &str) -> ConsumerResult<Box<dyn StoreSession>>;
}

/// An open broker channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Start consuming `queue` under the given consumer tag
    async fn consume(&self, queue: &str, consumer_tag: &str) -> ConsumerResult<DeliveryStream>;
}

/// Acknowledges deliveries on the broker that produced them
#[async_trait]
pub trait Acker: Send + Sync {
    /// Positively acknowledge a single delivery
    async fn ack(&self, delivery_tag: u64) -> ConsumerResult<()>;
}

/// Session on a document store
#[async_trait]
pub trait StoreSession: Send {
    /// Insert one document into a collection
    async fn insert(&mut self, collection: &str, document: Document) -> ConsumerResult<()>;

    /// Release the session
    async fn close(&mut self) -> ConsumerResult<()>;
}

struct AckHandle {
    acker: Option<Arc<dyn Acker>>,
    acked: AtomicBool,
}

/// A message received from the broker
///
/// Clones share one ack handle, so a delivery is acknowledged at most once
/// no matter how many copies of it exist.
#[derive(Clone)]
pub struct Delivery {
    body: Bytes,
    routing_key: String,
    delivery_tag: u64,
    handle: Arc<AckHandle>,
}

impl Delivery {
    /// Create a delivery acknowledged through `acker`
    pub fn new(
        body: Bytes,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            delivery_tag,
            handle: Arc::new(AckHandle {
                acker: Some(acker),
                acked: AtomicBool::new(false),
            }),
        }
    }

    /// Create a delivery that is not attached to any broker
    pub fn detached(body: Bytes, routing_key: impl Into<String>) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            delivery_tag: 0,
            handle: Arc::new(AckHandle {
                acker: None,
                acked: AtomicBool::new(false),
            }),
        }
    }

    /// Raw message body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Routing key the broker delivered the message with
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Broker-assigned delivery tag
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether `ack` has already been called on this delivery or a clone
    pub fn is_acknowledged(&self) -> bool {
        self.handle.acked.load(Ordering::Acquire)
    }

    /// Acknowledge the delivery. Only the first call reaches the broker.
    pub async fn ack(&self) -> ConsumerResult<()> {
        if self.handle.acked.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyAcknowledged(self.delivery_tag));
        }
        match &self.handle.acker {
            Some(acker) => acker.ack(self.delivery_tag).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}
