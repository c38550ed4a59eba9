use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::connection::KvConnection;
use super::gateway::{ClusterClient, PartitionStream};
use super::protocol::DcpMessage;
use super::types::{BucketConfig, Credentials, PartitionDescriptor};
use crate::config::StartFrom;
use crate::{Error, Result};

pub const DEFAULT_KV_PORT: u16 = 11210;

/// Upper bound on opening one partition stream, node handshake included.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// `ClusterClient` speaking the KV binary protocol directly to the nodes.
///
/// Setup runs on a single bootstrap connection. Streams are opened on one
/// DCP connection per node, created on first use and shared by every
/// partition that node is active for. Handshakes with different nodes run
/// independently, so a stalled node only holds up its own partitions.
pub struct CouchbaseClient {
    stream_name: String,
    start_from: StartFrom,
    channel_capacity: usize,
    open_timeout: Duration,
    session: RwLock<Option<Session>>,
    dcp_nodes: Mutex<HashMap<String, Arc<OnceCell<Arc<DcpNode>>>>>,
}

struct Session {
    bootstrap: KvConnection,
    bootstrap_host: String,
    bucket: Option<String>,
    credentials: Credentials,
    config: Option<BucketConfig>,
}

struct DcpNode {
    connection: KvConnection,
    high_seqnos: HashMap<u16, u64>,
}

impl CouchbaseClient {
    pub fn new(stream_name: String, start_from: StartFrom, channel_capacity: usize) -> Self {
        Self {
            stream_name,
            start_from,
            channel_capacity,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            session: RwLock::new(None),
            dcp_nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    async fn dcp_node(
        &self,
        address: &str,
        bucket: &str,
        credentials: &Credentials,
    ) -> Result<Arc<DcpNode>> {
        let cell = self
            .dcp_nodes
            .lock()
            .await
            .entry(address.to_string())
            .or_default()
            .clone();

        // a failed handshake leaves the cell empty for the next partition to retry
        let node = cell
            .get_or_try_init(|| self.open_dcp_node(address, bucket, credentials))
            .await?;
        Ok(node.clone())
    }

    async fn open_dcp_node(
        &self,
        address: &str,
        bucket: &str,
        credentials: &Credentials,
    ) -> Result<Arc<DcpNode>> {
        let connection = KvConnection::connect(address).await?;
        if !credentials.is_empty() {
            connection
                .authenticate(&credentials.username, &credentials.password)
                .await?;
        }
        connection.select_bucket(bucket).await?;
        connection.dcp_open(&self.stream_name).await?;

        let high_seqnos = match self.start_from {
            StartFrom::Now => connection.high_seqnos().await?,
            StartFrom::Beginning => HashMap::new(),
        };

        info!(
            node = %address,
            active_partitions = high_seqnos.len(),
            "Opened DCP connection '{}'",
            self.stream_name
        );

        Ok(Arc::new(DcpNode {
            connection,
            high_seqnos,
        }))
    }

    async fn start_position(&self, node: &DcpNode, partition: u16) -> Result<(u64, u64)> {
        match self.start_from {
            StartFrom::Beginning => Ok((0, 0)),
            StartFrom::Now => {
                let seqno = node.high_seqnos.get(&partition).copied().ok_or_else(|| {
                    Error::Protocol(format!(
                        "partition {} is not active on {}",
                        partition,
                        node.connection.address()
                    ))
                })?;
                let log = node.connection.failover_log(partition).await?;
                let uuid = log.first().map(|(uuid, _)| *uuid).unwrap_or(0);
                Ok((seqno, uuid))
            }
        }
    }

    async fn try_open_stream(&self, partition: &PartitionDescriptor) -> Result<PartitionStream> {
        let (address, credentials) = {
            let session = self.session.read().await;
            let session = session
                .as_ref()
                .ok_or_else(|| Error::Connection("not connected".to_string()))?;
            let config = session
                .config
                .as_ref()
                .ok_or_else(|| Error::Config("bucket configuration not loaded".to_string()))?;
            let node = config.active_node(partition.index, &session.bootstrap_host)?;
            let address = with_default_port(&node);
            (address, session.credentials.clone())
        };

        let node = self.dcp_node(&address, &partition.bucket, &credentials).await?;
        let (start_seqno, uuid) = self.start_position(&node, partition.index).await?;
        let rx = node
            .connection
            .open_stream(partition.index, start_seqno, uuid, self.channel_capacity)
            .await?;

        let events = ReceiverStream::new(rx).filter_map(|message| async move {
            match message {
                Ok(DcpMessage::Change { event, .. }) => Some(Ok(event)),
                Ok(DcpMessage::StreamEnd { partition, flags }) => {
                    debug!(partition, flags, "Partition stream ended by server");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        });

        Ok(events.boxed())
    }
}

#[async_trait]
impl ClusterClient for CouchbaseClient {
    async fn connect(&self, seed_nodes: &[String]) -> Result<()> {
        let mut last_error = Error::Connection("no seed nodes given".to_string());

        for seed in seed_nodes {
            let address = with_default_port(seed);
            match KvConnection::connect(&address).await {
                Ok(bootstrap) => {
                    *self.session.write().await = Some(Session {
                        bootstrap,
                        bootstrap_host: host_part(seed).to_string(),
                        bucket: None,
                        credentials: Credentials::default(),
                        config: None,
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!("Seed node {} unavailable: {}", address, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn open_bucket(&self, bucket: &str, credentials: &Credentials) -> Result<()> {
        let mut session = self.session.write().await;
        let session = session
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;

        if !credentials.is_empty() {
            session
                .bootstrap
                .authenticate(&credentials.username, &credentials.password)
                .await?;
        }
        session.bootstrap.select_bucket(bucket).await?;
        session.bucket = Some(bucket.to_string());
        session.credentials = credentials.clone();
        Ok(())
    }

    async fn bucket_config(&self, bucket: &str) -> Result<Option<Bytes>> {
        let mut session = self.session.write().await;
        let session = session
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;

        if session.bucket.as_deref() != Some(bucket) {
            return Ok(None);
        }

        let Some(raw) = session.bootstrap.cluster_config().await? else {
            return Ok(None);
        };
        let config = BucketConfig::parse(&raw)?;
        if config.name != bucket {
            return Ok(None);
        }
        session.config = Some(config);
        Ok(Some(raw))
    }

    async fn open_stream(&self, partition: &PartitionDescriptor) -> Result<PartitionStream> {
        let opened = tokio::time::timeout(self.open_timeout, self.try_open_stream(partition))
            .await
            .unwrap_or_else(|_| {
                let message = format!(
                    "stream request did not complete within {:?}",
                    self.open_timeout
                );
                Err(Error::Timeout { message })
            });

        opened.map_err(|e| Error::PartitionOpen {
            partition: partition.index,
            message: e.to_string(),
        })
    }

    async fn close(&self) {
        let nodes: Vec<_> = self.dcp_nodes.lock().await.drain().collect();
        if !nodes.is_empty() {
            info!(nodes = nodes.len(), "Closing DCP connections");
        }
    }
}

fn host_part(node: &str) -> &str {
    match node.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => node,
    }
}

/// Appends the KV port to bare host names.
pub fn with_default_port(node: &str) -> String {
    if host_part(node) == node {
        format!("{}:{}", node, DEFAULT_KV_PORT)
    } else {
        node.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("localhost"), "localhost:11210");
        assert_eq!(with_default_port("10.0.0.1:12000"), "10.0.0.1:12000");
    }

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("cb.local:11210"), "cb.local");
        assert_eq!(host_part("cb.local"), "cb.local");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = CouchbaseClient::new("b->t".to_string(), StartFrom::Now, 16);

        let result = client.open_bucket("default", &Credentials::default()).await;
        assert!(matches!(result, Err(Error::Connection(_))));

        let result = client.open_stream(&PartitionDescriptor::new(0, "default")).await;
        assert!(matches!(result, Err(Error::PartitionOpen { partition: 0, .. })));
    }
}
