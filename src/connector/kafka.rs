//! Kafka-compatible broker connector
//!
//! A queue is a topic and the routing key of a delivery is the topic it came
//! from. Acknowledging a delivery commits the offset after it.

use super::{Acker, BrokerChannel, Connector, Delivery, DeliveryStream, StoreSession};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::store::DocumentStore;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Properties that may be passed through to the client
const ALLOWED_KAFKA_PROPS: &[&str] = &[
    "auto.offset.reset",
    "client.id",
    "fetch.min.bytes",
    "heartbeat.interval.ms",
    "max.poll.interval.ms",
    "sasl.mechanisms",
    "sasl.password",
    "sasl.username",
    "security.protocol",
    "session.timeout.ms",
    "ssl.ca.location",
];

/// Kafka connection settings
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Additional client properties
    pub properties: HashMap<String, String>,
}

/// Connector creating one Kafka consumer per broker channel
#[derive(Clone)]
pub struct KafkaConnector {
    settings: KafkaSettings,
    store: Arc<dyn DocumentStore>,
}

impl KafkaConnector {
    /// Create a connector; dead letters go to `store`
    pub fn new(settings: KafkaSettings, store: Arc<dyn DocumentStore>) -> ConsumerResult<Self> {
        for key in settings.properties.keys() {
            if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
                return Err(ConsumerError::Config(format!(
                    "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                    key, ALLOWED_KAFKA_PROPS
                )));
            }
        }
        Ok(Self { settings, store })
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        for (key, value) in &self.settings.properties {
            client_config.set(key, value);
        }
        client_config
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    async fn acquire_broker_channel(&self) -> ConsumerResult<Box<dyn BrokerChannel>> {
        let consumer: StreamConsumer = self
            .client_config()
            .create()
            .map_err(|e| ConsumerError::Connection(format!("Failed to create consumer: {}", e)))?;
        Ok(Box::new(KafkaChannel {
            consumer: Arc::new(consumer),
        }))
    }

    async fn acquire_named_store(&self, name: &str) -> ConsumerResult<Box<dyn StoreSession>> {
        self.store.open_session(name).await
    }
}

struct KafkaChannel {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl BrokerChannel for KafkaChannel {
    async fn consume(&self, queue: &str, consumer_tag: &str) -> ConsumerResult<DeliveryStream> {
        self.consumer
            .subscribe(&[queue])
            .map_err(|e| ConsumerError::Consume(format!("Failed to subscribe: {}", e)))?;
        info!(topic = queue, consumer_tag, "Subscribed to topic");

        let consumer = self.consumer.clone();
        let acker = Arc::new(KafkaAcker {
            consumer: consumer.clone(),
            positions: DashMap::new(),
        });
        let next_tag = AtomicU64::new(0);

        Ok(Box::pin(async_stream::stream! {
            loop {
                let delivery = match consumer.recv().await {
                    Ok(message) => {
                        let tag = next_tag.fetch_add(1, Ordering::Relaxed) + 1;
                        let topic = message.topic().to_string();
                        acker
                            .positions
                            .insert(tag, (topic.clone(), message.partition(), message.offset()));
                        let body = Bytes::copy_from_slice(message.payload().unwrap_or_default());
                        Delivery::new(body, topic, tag, acker.clone() as Arc<dyn Acker>)
                    }
                    Err(e) => {
                        error!("Kafka error: {}", e);
                        break;
                    }
                };
                yield delivery;
            }
        }))
    }
}

struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    positions: DashMap<u64, (String, i32, i64)>,
}

#[async_trait]
impl Acker for KafkaAcker {
    async fn ack(&self, delivery_tag: u64) -> ConsumerResult<()> {
        let (_, (topic, partition, offset)) = self
            .positions
            .remove(&delivery_tag)
            .ok_or_else(|| ConsumerError::Ack(format!("Unknown delivery tag {}", delivery_tag)))?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| ConsumerError::Ack(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| ConsumerError::Ack(format!("Failed to commit offset: {}", e)))?;

        debug!(topic = %topic, partition, offset, "Offset committed");
        Ok(())
    }
}
