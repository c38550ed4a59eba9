//! Fan-out over every partition of a bucket and fan-in of their events.
//!
//! One task per partition opens its stream and forwards events into a
//! shared bounded channel. The consumer sees a single [`PartitionEvents`]
//! stream in arrival order: each partition's events stay in order, events of
//! different partitions interleave freely.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::gateway::ClusterClient;
use super::types::{PartitionDescriptor, PartitionEvent};
use crate::config::PartitionFailurePolicy;
use crate::Result;

pub struct PartitionStreamManager {
    client: Arc<dyn ClusterClient>,
    policy: PartitionFailurePolicy,
    channel_capacity: usize,
}

impl PartitionStreamManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        policy: PartitionFailurePolicy,
        channel_capacity: usize,
    ) -> Self {
        Self {
            client,
            policy,
            channel_capacity,
        }
    }

    /// Opens one stream per partition in `0..partition_count` concurrently
    /// and merges them. Cancelling `shutdown` stops every partition task.
    pub fn subscribe_all(
        &self,
        bucket: &str,
        partition_count: u16,
        shutdown: &CancellationToken,
    ) -> PartitionEvents {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = shutdown.child_token();
        let failed = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();

        info!(partitions = partition_count, "Subscribing to all partitions of '{}'", bucket);

        for index in 0..partition_count {
            tasks.spawn(run_partition(
                self.client.clone(),
                PartitionDescriptor::new(index, bucket),
                self.policy,
                tx.clone(),
                cancel.clone(),
                failed.clone(),
            ));
        }

        PartitionEvents {
            events: ReceiverStream::new(rx),
            tasks,
            cancel,
            failed,
        }
    }
}

/// Merged event sequence of all partitions.
///
/// Yields `Err` once if a partition stream breaks (or, with the `abort`
/// policy, fails to open). Ends when every partition stream has ended.
pub struct PartitionEvents {
    events: ReceiverStream<Result<PartitionEvent>>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    failed: Arc<Mutex<Vec<u16>>>,
}

impl PartitionEvents {
    /// Partitions left out of the merge because their stream did not open.
    pub async fn failed_partitions(&self) -> Vec<u16> {
        let mut failed = self.failed.lock().await.clone();
        failed.sort_unstable();
        failed
    }

    /// Stops all partition tasks and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.events.close();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Partition task panicked: {}", e);
                }
            }
        }
        debug!("All partition tasks stopped");
    }
}

impl Stream for PartitionEvents {
    type Item = Result<PartitionEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for PartitionEvents {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_partition(
    client: Arc<dyn ClusterClient>,
    descriptor: PartitionDescriptor,
    policy: PartitionFailurePolicy,
    tx: mpsc::Sender<Result<PartitionEvent>>,
    cancel: CancellationToken,
    failed: Arc<Mutex<Vec<u16>>>,
) {
    let partition = descriptor.index;

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = client.open_stream(&descriptor) => opened,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            match policy {
                PartitionFailurePolicy::Skip => {
                    warn!(partition, "Skipping partition: {}", e);
                    failed.lock().await.push(partition);
                }
                PartitionFailurePolicy::Abort => {
                    error!(partition, "Partition stream could not be opened: {}", e);
                    let _ = tx.send(Err(e)).await;
                }
            }
            return;
        }
    };

    debug!(partition, "Partition stream open");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(partition, "Partition stream cancelled");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    if tx.send(Ok(PartitionEvent { partition, event })).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(partition, "Partition stream failed: {}", e);
                    let _ = tx.send(Err(e)).await;
                    break;
                }
                None => {
                    debug!(partition, "Partition stream ended");
                    break;
                }
            }
        }
    }
}
