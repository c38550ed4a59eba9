use crate::stats::ForwarderStats;
use crate::{config::KafkaConfig, Error, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause before offering a message again to a full local queue.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// Keyed, fire-and-forget hand-off of encoded messages to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Queues `payload` under `key`, waiting while the client's local
    /// queue is full. An empty payload is not sent.
    async fn publish(&self, key: &[u8], payload: &[u8]) -> Result<()>;

    /// Waits up to `timeout` for queued messages to be delivered.
    fn flush(&self, timeout: Duration) -> Result<()>;

    fn topic(&self) -> &str;
}

/// Publisher backed by an rdkafka `FutureProducer`.
///
/// The broker partition is picked by hashing the key with the configured
/// partitioner, so every change of one document lands on one partition in
/// the order it was queued. Delivery reports are awaited on spawned tasks
/// and only counted; there is no retry beyond librdkafka's own.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    stats: Arc<ForwarderStats>,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig, stats: Arc<ForwarderStats>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("batch.size", config.batch_size.to_string())
            .set(
                "queue.buffering.max.kbytes",
                config.queue_buffering_max_kbytes.to_string(),
            )
            .set("partitioner", &config.partitioner)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        info!(
            brokers = %config.brokers.join(","),
            topic = %config.topic,
            partitioner = %config.partitioner,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            stats,
        })
    }

    /// Same producer, different destination topic.
    pub fn for_topic(&self, topic: &str) -> Self {
        Self {
            producer: self.producer.clone(),
            topic: topic.to_string(),
            stats: self.stats.clone(),
        }
    }

    pub fn in_flight(&self) -> i32 {
        self.producer.in_flight_count()
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }

        let mut record = FutureRecord::to(&self.topic).key(key).payload(payload);
        let mut waited = false;
        let delivery = loop {
            match self.producer.send_result(record) {
                Ok(delivery) => break delivery,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    if !waited {
                        debug!(topic = %self.topic, "Producer queue full, waiting for room");
                        waited = true;
                    }
                    record = returned;
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((e, _record)) => return Err(Error::Kafka(e)),
            }
        };

        let stats = self.stats.clone();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => {
                    stats.record_delivered();
                    debug!(topic = %topic, partition, offset, "Message delivered");
                }
                Ok(Err((e, _message))) => {
                    stats.record_publish_failure();
                    warn!(topic = %topic, "Message delivery failed: {}", e);
                }
                Err(_canceled) => {
                    stats.record_publish_failure();
                    warn!(topic = %topic, "Producer dropped before delivery report");
                }
            }
        });

        Ok(())
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        debug!(in_flight = self.in_flight(), "Flushing producer");
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(Error::Kafka)
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
