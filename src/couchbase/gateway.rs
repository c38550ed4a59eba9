use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::types::{BucketConfig, ChangeEvent, Credentials, PartitionDescriptor};
use crate::{Error, Result};

/// Change events of one partition, in the order the server sent them.
pub type PartitionStream = BoxStream<'static, Result<ChangeEvent>>;

/// The operations consumed from the source cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Bootstraps against the first reachable seed node.
    async fn connect(&self, seed_nodes: &[String]) -> Result<()>;

    async fn open_bucket(&self, bucket: &str, credentials: &Credentials) -> Result<()>;

    /// Raw JSON configuration of `bucket`, `None` if the cluster has no
    /// such bucket.
    async fn bucket_config(&self, bucket: &str) -> Result<Option<Bytes>>;

    /// Starts the change stream of a single partition.
    async fn open_stream(&self, partition: &PartitionDescriptor) -> Result<PartitionStream>;

    /// Drops the connections behind any streams opened so far.
    async fn close(&self) {}
}

/// Setup handshake against the cluster, each step bounded by a timeout.
pub struct ClusterGateway {
    client: Arc<dyn ClusterClient>,
    setup_timeout: Duration,
}

impl ClusterGateway {
    pub fn new(client: Arc<dyn ClusterClient>, setup_timeout: Duration) -> Self {
        Self {
            client,
            setup_timeout,
        }
    }

    pub fn client(&self) -> Arc<dyn ClusterClient> {
        self.client.clone()
    }

    #[instrument(skip(self), fields(timeout = ?self.setup_timeout))]
    pub async fn connect(&self, seed_nodes: &[String]) -> Result<()> {
        self.bounded("connect", self.client.connect(seed_nodes)).await?;
        info!("Connected to cluster");
        Ok(())
    }

    #[instrument(skip(self, credentials))]
    pub async fn open_bucket(&self, bucket: &str, credentials: &Credentials) -> Result<()> {
        self.bounded("open bucket", self.client.open_bucket(bucket, credentials))
            .await?;
        info!("Bucket '{}' opened", bucket);
        Ok(())
    }

    /// Number of partitions backing `bucket`, read from the live cluster
    /// configuration.
    #[instrument(skip(self))]
    pub async fn partition_count(&self, bucket: &str) -> Result<u16> {
        let raw = self
            .bounded("fetch cluster configuration", self.client.bucket_config(bucket))
            .await?
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))?;

        let count = BucketConfig::parse(&raw)?.partition_count()?;
        info!(partitions = count, "Resolved partition count for '{}'", bucket);
        Ok(count)
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.setup_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                message: format!("{} did not complete within {:?}", operation, self.setup_timeout),
            }),
        }
    }
}
