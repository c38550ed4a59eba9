//! Scripted cluster and recording publisher used by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::couchbase::{
    ChangeEvent, ClusterClient, Credentials, PartitionDescriptor, PartitionStream,
};
use crate::kafka::Publisher;
use crate::{Error, Result};

pub fn mutation(key: &str, cas: u64, body: &str) -> ChangeEvent {
    ChangeEvent::Mutation {
        key: key.to_string(),
        expiration: 0,
        flags: 0,
        cas,
        lock_time: 0,
        content: Bytes::copy_from_slice(body.as_bytes()),
    }
}

pub fn removal(key: &str, cas: u64) -> ChangeEvent {
    ChangeEvent::Removal {
        key: key.to_string(),
        cas,
    }
}

/// Minimal cluster configuration with `partitions` vbuckets on one node.
pub fn bucket_config_json(bucket: &str, partitions: usize) -> Bytes {
    let config = serde_json::json!({
        "name": bucket,
        "vBucketServerMap": {
            "serverList": ["$HOST:11210"],
            "vBucketMap": vec![vec![0]; partitions],
        }
    });
    Bytes::from(config.to_string())
}

/// What a partition does once its stream is requested.
#[derive(Debug, Clone)]
pub enum PartitionScript {
    /// Emits the events, then ends.
    Events(Vec<ChangeEvent>),
    /// Emits the events, then fails as a dropped connection would.
    EventsThenError(Vec<ChangeEvent>, String),
    /// Stream request is refused.
    FailOpen(String),
    /// Opens but never emits anything.
    Pending,
    /// Emits removals of `key` with increasing CAS until dropped.
    Endless(String),
}

pub struct MockCluster {
    hanging_connect: bool,
    bucket_config: Option<Bytes>,
    default_script: PartitionScript,
    scripts: HashMap<u16, PartitionScript>,
    calls: Mutex<Vec<&'static str>>,
    opened: Mutex<Vec<u16>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            hanging_connect: false,
            bucket_config: None,
            default_script: PartitionScript::Pending,
            scripts: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn with_hanging_connect(mut self) -> Self {
        self.hanging_connect = true;
        self
    }

    pub fn with_bucket_config(mut self, config: Bytes) -> Self {
        self.bucket_config = Some(config);
        self
    }

    pub fn with_default_script(mut self, script: PartitionScript) -> Self {
        self.default_script = script;
        self
    }

    pub fn with_partition(mut self, partition: u16, script: PartitionScript) -> Self {
        self.scripts.insert(partition, script);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    /// Partitions a stream was requested for, sorted.
    pub fn opened_partitions(&self) -> Vec<u16> {
        let mut opened = self.opened.lock().unwrap().clone();
        opened.sort_unstable();
        opened
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn connect(&self, _seed_nodes: &[String]) -> Result<()> {
        self.record("connect");
        if self.hanging_connect {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn open_bucket(&self, _bucket: &str, _credentials: &Credentials) -> Result<()> {
        self.record("open_bucket");
        Ok(())
    }

    async fn bucket_config(&self, _bucket: &str) -> Result<Option<Bytes>> {
        self.record("bucket_config");
        Ok(self.bucket_config.clone())
    }

    async fn close(&self) {
        self.record("close");
    }

    async fn open_stream(&self, partition: &PartitionDescriptor) -> Result<PartitionStream> {
        self.opened.lock().unwrap().push(partition.index);
        let index = partition.index;
        let script = self
            .scripts
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());

        match script {
            PartitionScript::Events(events) => {
                Ok(stream::iter(events.into_iter().map(Ok)).boxed())
            }
            PartitionScript::EventsThenError(events, message) => {
                let failure = stream::once(async move {
                    Err(Error::Stream {
                        partition: index,
                        message,
                    })
                });
                Ok(stream::iter(events.into_iter().map(Ok)).chain(failure).boxed())
            }
            PartitionScript::FailOpen(message) => Err(Error::PartitionOpen {
                partition: index,
                message,
            }),
            PartitionScript::Pending => Ok(stream::pending().boxed()),
            PartitionScript::Endless(key) => {
                Ok(stream::iter(1u64..).map(move |cas| Ok(removal(&key, cas))).boxed())
            }
        }
    }
}

/// Publisher that keeps every call in memory.
pub struct RecordingPublisher {
    topic: String,
    published: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    flushed: AtomicBool,
}

impl RecordingPublisher {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            published: Mutex::new(Vec::new()),
            flushed: AtomicBool::new(false),
        }
    }

    pub fn published(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Published keys as strings, in submission order.
    pub fn keys(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .map(|(key, _)| String::from_utf8(key).unwrap())
            .collect()
    }

    pub fn was_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((key.to_vec(), payload.to_vec()));
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
