use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{self, opcode, status, DcpMessage, Packet};
use crate::{Error, Result};

/// One TCP connection to a KV node.
///
/// A background reader task owns the read half and routes every frame by
/// its opaque: responses complete the matching pending request, DCP pushes
/// go to the channel of the stream that was opened with that opaque.
pub struct KvConnection {
    address: String,
    shared: Arc<Shared>,
    next_opaque: AtomicU32,
    reader_task: JoinHandle<()>,
}

struct Shared {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Packet>>>,
    streams: Mutex<HashMap<u32, StreamSlot>>,
}

struct StreamSlot {
    partition: u16,
    tx: mpsc::Sender<Result<DcpMessage>>,
}

impl KvConnection {
    pub async fn connect(address: &str) -> Result<Self> {
        debug!("Connecting to KV node {}", address);

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Shared {
            address: address.to_string(),
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        });

        let reader_task = tokio::spawn(read_loop(reader, shared.clone()));

        info!("Connected to KV node {}", address);

        Ok(Self {
            address: address.to_string(),
            shared,
            next_opaque: AtomicU32::new(1),
            reader_task,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn allocate_opaque(&self) -> u32 {
        self.next_opaque.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a request and waits for the response carrying the same opaque.
    pub async fn request(&self, packet: Packet) -> Result<Packet> {
        let opaque = self.allocate_opaque();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(opaque, tx);

        if let Err(e) = self.shared.write(&packet.with_opaque(opaque)).await {
            self.shared.pending.lock().await.remove(&opaque);
            return Err(e);
        }

        rx.await.map_err(|_| {
            Error::Connection(format!("connection to {} closed", self.address))
        })
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        let response = self.request(protocol::sasl_plain(username, password)).await?;
        protocol::check_status(&response, "SASL_AUTH")
    }

    pub async fn select_bucket(&self, bucket: &str) -> Result<()> {
        let response = self.request(protocol::select_bucket(bucket)).await?;
        match response.status() {
            status::KEY_NOT_FOUND => Err(Error::BucketNotFound(bucket.to_string())),
            _ => protocol::check_status(&response, "SELECT_BUCKET"),
        }
    }

    /// Raw JSON configuration of the selected bucket.
    pub async fn cluster_config(&self) -> Result<Option<bytes::Bytes>> {
        let response = self.request(protocol::get_cluster_config()).await?;
        match response.status() {
            status::KEY_NOT_FOUND | status::NOT_SUPPORTED => Ok(None),
            _ => {
                protocol::check_status(&response, "GET_CLUSTER_CONFIG")?;
                Ok(Some(response.value))
            }
        }
    }

    pub async fn dcp_open(&self, name: &str) -> Result<()> {
        let response = self.request(protocol::dcp_open(name)).await?;
        protocol::check_status(&response, "DCP_OPEN")
    }

    pub async fn high_seqnos(&self) -> Result<HashMap<u16, u64>> {
        let response = self.request(protocol::get_all_vb_seqnos()).await?;
        protocol::check_status(&response, "GET_ALL_VB_SEQNOS")?;
        protocol::parse_seqnos(&response.value)
    }

    pub async fn failover_log(&self, partition: u16) -> Result<Vec<(u64, u64)>> {
        let response = self.request(protocol::failover_log(partition)).await?;
        protocol::check_status(&response, "DCP_GET_FAILOVER_LOG")?;
        protocol::parse_failover_log(&response.value)
    }

    /// Issues `DCP_STREAM_REQ` for one partition and returns the channel its
    /// messages are delivered on. The channel closes after `STREAM_END`.
    pub async fn open_stream(
        &self,
        partition: u16,
        start_seqno: u64,
        vbucket_uuid: u64,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Result<DcpMessage>>> {
        let opaque = self.allocate_opaque();
        let (tx, rx) = mpsc::channel(capacity);
        self.shared
            .streams
            .lock()
            .await
            .insert(opaque, StreamSlot { partition, tx });

        let (response_tx, response_rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(opaque, response_tx);

        let request =
            protocol::stream_request(partition, start_seqno, vbucket_uuid).with_opaque(opaque);
        let result = match self.shared.write(&request).await {
            Ok(()) => response_rx.await.map_err(|_| {
                Error::Connection(format!("connection to {} closed", self.address))
            }),
            Err(e) => Err(e),
        };

        let outcome = result.and_then(|response| match response.status() {
            status::ROLLBACK => Err(Error::Protocol(format!(
                "server requested rollback of partition {}",
                partition
            ))),
            _ => protocol::check_status(&response, "DCP_STREAM_REQ"),
        });

        if let Err(e) = outcome {
            self.shared.pending.lock().await.remove(&opaque);
            self.shared.streams.lock().await.remove(&opaque);
            return Err(e);
        }

        debug!(partition, start_seqno, "Stream opened on {}", self.address);
        Ok(rx)
    }
}

impl Drop for KvConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl Shared {
    async fn write(&self, packet: &Packet) -> Result<()> {
        let frame = packet.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn dispatch(&self, packet: Packet) -> Result<()> {
        if packet.is_response() {
            match self.pending.lock().await.remove(&packet.opaque) {
                Some(waiter) => {
                    let _ = waiter.send(packet);
                }
                None => trace!(opaque = packet.opaque, "Response without waiter"),
            }
            return Ok(());
        }

        if packet.opcode == opcode::DCP_NOOP {
            trace!("Answering DCP noop from {}", self.address);
            return self
                .write(&Packet::response(opcode::DCP_NOOP, status::SUCCESS, packet.opaque))
                .await;
        }

        let slot = {
            let streams = self.streams.lock().await;
            streams
                .get(&packet.opaque)
                .map(|slot| (slot.partition, slot.tx.clone()))
        };
        let Some((partition, tx)) = slot else {
            trace!(opaque = packet.opaque, opcode = packet.opcode, "Message for unknown stream");
            return Ok(());
        };

        let (message, finished) = match DcpMessage::decode(&packet) {
            Ok(message @ DcpMessage::StreamEnd { .. }) => (Ok(message), true),
            Ok(message) => (Ok(message), false),
            Err(e) => (
                Err(Error::Stream {
                    partition,
                    message: e.to_string(),
                }),
                true,
            ),
        };

        let delivered = tx.send(message).await.is_ok();
        if finished || !delivered {
            self.streams.lock().await.remove(&packet.opaque);
        }
        Ok(())
    }

    async fn fail_all(&self, cause: &Error) {
        self.pending.lock().await.clear();

        let streams: Vec<StreamSlot> = self.streams.lock().await.drain().map(|(_, s)| s).collect();
        for slot in streams {
            let _ = slot
                .tx
                .send(Err(Error::Stream {
                    partition: slot.partition,
                    message: cause.to_string(),
                }))
                .await;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(64 * 1024);

    let cause = loop {
        match Packet::decode(&mut buf) {
            Ok(Some(packet)) => {
                if let Err(e) = shared.dispatch(packet).await {
                    break e;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => break e,
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                break Error::Connection(format!("{} closed the connection", shared.address));
            }
            Ok(_) => {}
            Err(e) => break Error::Io(e),
        }
    };

    if shared.streams.lock().await.is_empty() {
        warn!("Connection to {} ended: {}", shared.address, cause);
    } else {
        error!("Connection to {} failed with open streams: {}", shared.address, cause);
    }
    shared.fail_all(&cause).await;
}
