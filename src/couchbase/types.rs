use bytes::Bytes;
use serde::Deserialize;

use crate::{Error, Result};

/// A single change reported by a partition's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Mutation {
        key: String,
        expiration: u32,
        flags: u32,
        cas: u64,
        lock_time: u32,
        content: Bytes,
    },
    Removal {
        key: String,
        cas: u64,
    },
}

impl ChangeEvent {
    pub fn key(&self) -> &str {
        match self {
            ChangeEvent::Mutation { key, .. } | ChangeEvent::Removal { key, .. } => key,
        }
    }

    pub fn cas(&self) -> u64 {
        match self {
            ChangeEvent::Mutation { cas, .. } | ChangeEvent::Removal { cas, .. } => *cas,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Mutation { .. } => "mutation",
            ChangeEvent::Removal { .. } => "remove",
        }
    }
}

/// An event tagged with the partition that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEvent {
    pub partition: u16,
    pub event: ChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub index: u16,
    pub bucket: String,
}

impl PartitionDescriptor {
    pub fn new(index: u16, bucket: impl Into<String>) -> Self {
        Self {
            index,
            bucket: bucket.into(),
        }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The subset of a bucket's cluster configuration this crate reads.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VBucketServerMap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VBucketServerMap {
    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

impl BucketConfig {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Config(format!("malformed bucket configuration: {}", e)))
    }

    pub fn partition_count(&self) -> Result<u16> {
        let map = self.vbucket_server_map.as_ref().ok_or_else(|| {
            Error::Config(format!("bucket '{}' has no vBucketServerMap", self.name))
        })?;

        match u16::try_from(map.vbucket_map.len()) {
            Ok(0) => Err(Error::Config(format!(
                "bucket '{}' reports zero partitions",
                self.name
            ))),
            Ok(count) => Ok(count),
            Err(_) => Err(Error::Config(format!(
                "bucket '{}' reports {} partitions",
                self.name,
                map.vbucket_map.len()
            ))),
        }
    }

    /// Address of the node holding the active copy of `partition`, with
    /// `$HOST` replaced by the host the configuration was fetched from.
    pub fn active_node(&self, partition: u16, bootstrap_host: &str) -> Result<String> {
        let map = self.vbucket_server_map.as_ref().ok_or_else(|| {
            Error::Config(format!("bucket '{}' has no vBucketServerMap", self.name))
        })?;

        let server_index = map
            .vbucket_map
            .get(partition as usize)
            .and_then(|chain| chain.first())
            .copied()
            .ok_or_else(|| Error::Config(format!("partition {} is not mapped", partition)))?;

        let server = usize::try_from(server_index)
            .ok()
            .and_then(|idx| map.server_list.get(idx))
            .ok_or_else(|| {
                Error::Config(format!("partition {} has no active node", partition))
            })?;

        Ok(server.replace("$HOST", bootstrap_host))
    }
}
