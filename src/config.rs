use crate::couchbase::Credentials;
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub couchbase: CouchbaseConfig,
    pub kafka: KafkaConfig,
    pub forwarder: ForwarderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CouchbaseConfig {
    #[serde(deserialize_with = "node_list")]
    pub nodes: Vec<String>,
    pub bucket: String,
    pub username: String,
    pub password: String,
    pub setup_timeout_ms: u64,
    pub start_from: StartFrom,
}

/// Where each partition stream begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Current high sequence number; only changes made after subscribing.
    #[default]
    Now,
    /// Sequence number zero; the whole retained change history.
    Beginning,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KafkaConfig {
    #[serde(deserialize_with = "node_list")]
    pub brokers: Vec<String>,
    pub topic: String,
    pub compression: String,
    pub acks: String,
    pub linger_ms: u32,
    pub batch_size: usize,
    pub queue_buffering_max_kbytes: usize,
    pub partitioner: String,
    pub dead_letter_topic: Option<String>,
    pub flush_timeout_secs: u64,
    /// How long librdkafka keeps trying to deliver a queued message.
    pub message_timeout_ms: u64,
}

/// What to do when a single partition refuses its stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartitionFailurePolicy {
    /// Log it, leave the partition out of the merge and keep going.
    #[default]
    Skip,
    /// Fail the whole run.
    Abort,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub partition_failure_policy: PartitionFailurePolicy,
    pub channel_capacity: usize,
    pub stats_interval_secs: u64,
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bucket: Option<String>,
    pub couchbase_nodes: Option<String>,
    pub kafka_nodes: Option<String>,
    pub topic: Option<String>,
}

impl Config {
    /// Layers defaults, an optional TOML file, `CB_CAPTURE_*` environment
    /// variables and command line overrides, in that order.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("CB_CAPTURE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_override_option("couchbase.bucket", overrides.bucket.clone())
            .and_then(|b| {
                b.set_override_option("couchbase.nodes", overrides.couchbase_nodes.clone())
            })
            .and_then(|b| b.set_override_option("kafka.brokers", overrides.kafka_nodes.clone()))
            .and_then(|b| b.set_override_option("kafka.topic", overrides.topic.clone()))
            .and_then(|b| b.build())
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()), &Overrides::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.couchbase.nodes.is_empty() {
            return Err(Error::Config("couchbase.nodes must not be empty".to_string()));
        }
        if self.couchbase.bucket.is_empty() {
            return Err(Error::Config("couchbase.bucket must not be empty".to_string()));
        }
        if self.couchbase.setup_timeout_ms == 0 {
            return Err(Error::Config("couchbase.setup_timeout_ms must be positive".to_string()));
        }
        if self.kafka.brokers.is_empty() {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.kafka.topic.is_empty() {
            return Err(Error::Config("kafka.topic must not be empty".to_string()));
        }
        if self.forwarder.channel_capacity == 0 {
            return Err(Error::Config("forwarder.channel_capacity must be positive".to_string()));
        }
        Ok(())
    }

    /// Name announced to the cluster when opening DCP connections.
    pub fn stream_name(&self) -> String {
        format!("{}->{}", self.couchbase.bucket, self.kafka.topic)
    }
}

impl CouchbaseConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }
}

impl KafkaConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

impl Default for CouchbaseConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["localhost".to_string()],
            bucket: "default".to_string(),
            username: String::new(),
            password: String::new(),
            setup_timeout_ms: default_setup_timeout_ms(),
            start_from: StartFrom::Now,
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost".to_string()],
            topic: "default".to_string(),
            compression: "none".to_string(),
            acks: "all".to_string(),
            linger_ms: 5,
            batch_size: 16384,
            queue_buffering_max_kbytes: 1_048_576, // 1GB
            partitioner: "murmur2_random".to_string(),
            dead_letter_topic: None,
            flush_timeout_secs: 10,
            message_timeout_ms: 300_000,
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            partition_failure_policy: PartitionFailurePolicy::Skip,
            channel_capacity: 10_000,
            stats_interval_secs: 30,
        }
    }
}

fn default_setup_timeout_ms() -> u64 {
    2000
}

/// Splits a comma separated node string, trimming blanks.
pub fn split_nodes(nodes: &str) -> Vec<String> {
    nodes
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accepts `"a,b"` as well as `["a", "b"]`.
fn node_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct NodeList;

    impl<'de> serde::de::Visitor<'de> for NodeList {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a list of nodes or a comma separated string")
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(split_nodes(v))
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut nodes = Vec::new();
            while let Some(node) = seq.next_element::<String>()? {
                nodes.extend(split_nodes(&node));
            }
            Ok(nodes)
        }
    }

    deserializer.deserialize_any(NodeList)
}
