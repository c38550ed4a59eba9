//! The forwarding pipeline: cluster setup, partition fan-in, encoding and
//! publishing, driven by one consumer loop.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::couchbase::{
    ChangeEvent, ClusterClient, ClusterGateway, CouchbaseClient, PartitionEvent, PartitionEvents,
    PartitionStreamManager,
};
use crate::kafka::{JsonEncoder, KafkaPublisher, Publisher};
use crate::stats::{ForwarderStats, StatsSnapshot};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwarderState {
    Init,
    Connected,
    BucketOpen,
    Streaming,
    Stopped,
    Failed,
}

/// Outcome of a run that ended without error.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: ForwarderState,
    pub stats: StatsSnapshot,
    /// Partitions skipped because their stream could not be opened.
    pub failed_partitions: Vec<u16>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Forwarder {
    config: Config,
    client: Arc<dyn ClusterClient>,
    publisher: Arc<dyn Publisher>,
    dead_letters: Option<Arc<dyn Publisher>>,
    encoder: JsonEncoder,
    stats: Arc<ForwarderStats>,
    state: ForwarderState,
}

impl Forwarder {
    pub fn new(
        config: Config,
        client: Arc<dyn ClusterClient>,
        publisher: Arc<dyn Publisher>,
        stats: Arc<ForwarderStats>,
    ) -> Self {
        Self {
            config,
            client,
            publisher,
            dead_letters: None,
            encoder: JsonEncoder::new(),
            stats,
            state: ForwarderState::Init,
        }
    }

    /// Events that fail to encode are published here instead of dropped.
    pub fn with_dead_letters(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dead_letters = Some(publisher);
        self
    }

    /// Wires the DCP client and Kafka producer described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let stats = Arc::new(ForwarderStats::new());
        let client = Arc::new(
            CouchbaseClient::new(
                config.stream_name(),
                config.couchbase.start_from,
                config.forwarder.channel_capacity,
            )
            .with_open_timeout(config.couchbase.setup_timeout()),
        );
        let publisher = KafkaPublisher::new(&config.kafka, stats.clone())?;
        let dead_letters = config
            .kafka
            .dead_letter_topic
            .as_deref()
            .map(|topic| Arc::new(publisher.for_topic(topic)) as Arc<dyn Publisher>);

        let forwarder = Self::new(config, client, Arc::new(publisher), stats);
        Ok(match dead_letters {
            Some(dead_letters) => forwarder.with_dead_letters(dead_letters),
            None => forwarder,
        })
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        self.stats.clone()
    }

    /// Runs until every partition stream ends, a stream fails or `shutdown`
    /// is cancelled. The publisher is flushed on every exit path.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunSummary> {
        let started_at = Utc::now();
        info!(
            bucket = %self.config.couchbase.bucket,
            topic = %self.publisher.topic(),
            "Starting forwarder"
        );

        let outcome = self.stream_changes(&shutdown).await;
        self.flush().await;

        let outcome = match outcome {
            Err(Error::Shutdown) => {
                info!("Shutdown requested during setup");
                Ok(Vec::new())
            }
            other => other,
        };

        let stats = self.stats.snapshot();
        match outcome {
            Ok(failed_partitions) => {
                self.transition(ForwarderState::Stopped);
                info!(
                    received = stats.events_received,
                    published = stats.published,
                    encode_failures = stats.encode_failures,
                    skipped_partitions = failed_partitions.len(),
                    "Forwarder stopped"
                );
                Ok(RunSummary {
                    state: self.state,
                    stats,
                    failed_partitions,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(e) => {
                self.transition(ForwarderState::Failed);
                if e.is_setup_error() {
                    error!(bucket = %self.config.couchbase.bucket, "Cluster setup failed: {}", e);
                } else {
                    error!(
                        received = stats.events_received,
                        published = stats.published,
                        "Forwarder failed: {}",
                        e
                    );
                }
                Err(e)
            }
        }
    }

    async fn stream_changes(&mut self, shutdown: &CancellationToken) -> Result<Vec<u16>> {
        let couchbase = self.config.couchbase.clone();
        let gateway = ClusterGateway::new(self.client.clone(), couchbase.setup_timeout());

        until_cancelled(shutdown, gateway.connect(&couchbase.nodes)).await?;
        self.transition(ForwarderState::Connected);

        until_cancelled(
            shutdown,
            gateway.open_bucket(&couchbase.bucket, &couchbase.credentials()),
        )
        .await?;
        self.transition(ForwarderState::BucketOpen);

        let partitions =
            until_cancelled(shutdown, gateway.partition_count(&couchbase.bucket)).await?;

        let manager = PartitionStreamManager::new(
            gateway.client(),
            self.config.forwarder.partition_failure_policy,
            self.config.forwarder.channel_capacity,
        );
        let mut events = manager.subscribe_all(&couchbase.bucket, partitions, shutdown);
        self.transition(ForwarderState::Streaming);

        let result = self.consume(&mut events, shutdown).await;
        let failed = events.failed_partitions().await;
        events.shutdown().await;
        self.client.close().await;

        result.map(|()| failed)
    }

    async fn consume(
        &self,
        events: &mut PartitionEvents,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let period = Duration::from_secs(self.config.forwarder.stats_interval_secs.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, closing partition streams");
                    return Ok(());
                }
                _ = ticker.tick() => self.log_stats(),
                item = events.next() => match item {
                    Some(Ok(PartitionEvent { partition, event })) => {
                        // a full producer queue must not hold up shutdown
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => {
                                info!("Shutdown requested while waiting for the producer");
                                return Ok(());
                            }
                            _ = self.forward(partition, &event) => {}
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        info!("All partition streams ended");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn forward(&self, partition: u16, event: &ChangeEvent) {
        self.stats
            .record_event(matches!(event, ChangeEvent::Mutation { .. }));

        let payload = match self.encoder.try_encode(event) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_encode_failure();
                warn!(
                    partition,
                    key = %event.key(),
                    cas = event.cas(),
                    "Dropping change event: {}",
                    e
                );
                self.dead_letter(event, &e).await;
                return;
            }
        };

        match self.publisher.publish(event.key().as_bytes(), &payload).await {
            Ok(()) => {
                self.stats.record_published();
                debug!(partition, key = %event.key(), event = event.kind(), "Change event queued");
            }
            Err(e) => {
                self.stats.record_publish_failure();
                warn!(partition, key = %event.key(), "Failed to queue change event: {}", e);
            }
        }
    }

    async fn dead_letter(&self, event: &ChangeEvent, cause: &Error) {
        let Some(dead_letters) = &self.dead_letters else {
            return;
        };

        let published = match self.encoder.dead_letter(event, cause) {
            Ok(record) => dead_letters.publish(event.key().as_bytes(), &record).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => self.stats.record_dead_lettered(),
            Err(e) => {
                self.stats.record_publish_failure();
                warn!(
                    key = %event.key(),
                    topic = %dead_letters.topic(),
                    "Failed to queue dead letter: {}",
                    e
                );
            }
        }
    }

    async fn flush(&self) {
        let timeout = self.config.kafka.flush_timeout();
        let publishers = std::iter::once(self.publisher.clone()).chain(self.dead_letters.clone());

        for publisher in publishers {
            let topic = publisher.topic().to_string();
            match tokio::task::spawn_blocking(move || publisher.flush(timeout)).await {
                Ok(Ok(())) => debug!(topic = %topic, "Publisher flushed"),
                Ok(Err(e)) => warn!(topic = %topic, "Flush did not complete: {}", e),
                Err(e) => warn!(topic = %topic, "Flush task failed: {}", e),
            }
        }
    }

    fn log_stats(&self) {
        let stats = self.stats.snapshot();
        info!(
            received = stats.events_received,
            mutations = stats.mutations,
            removals = stats.removals,
            published = stats.published,
            delivered = stats.delivered,
            publish_failures = stats.publish_failures,
            encode_failures = stats.encode_failures,
            dead_lettered = stats.dead_lettered,
            "Forwarder statistics"
        );
    }

    fn transition(&mut self, next: ForwarderState) {
        debug!(from = ?self.state, to = ?next, "Forwarder state change");
        self.state = next;
    }
}

async fn until_cancelled<T>(
    shutdown: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(Error::Shutdown),
        result = fut => result,
    }
}
