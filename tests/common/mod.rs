#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use cb_capture::config::Config;
use cb_capture::couchbase::protocol::{opcode, status};
use cb_capture::couchbase::Packet;
use cb_capture::kafka::Publisher;
use cb_capture::Result;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    let mut config = Config::default();
    config.couchbase.nodes = env::var("TEST_CB_NODES")
        .map(|nodes| cb_capture::config::split_nodes(&nodes))
        .unwrap_or_else(|_| vec!["localhost".to_string()]);
    config.couchbase.bucket = env::var("TEST_CB_BUCKET").unwrap_or_else(|_| "default".to_string());
    config.couchbase.username = env::var("TEST_CB_USERNAME").unwrap_or_default();
    config.couchbase.password = env::var("TEST_CB_PASSWORD").unwrap_or_default();
    config.couchbase.setup_timeout_ms = 5000;

    config.kafka.brokers = env::var("TEST_KAFKA_BROKERS")
        .map(|brokers| cb_capture::config::split_nodes(&brokers))
        .unwrap_or_else(|_| vec!["localhost:9092".to_string()]);
    config.kafka.topic = format!("test_changes_{}", std::process::id());
    config.kafka.linger_ms = 0; // Immediate sending for tests
    config.kafka.batch_size = 1;
    config.forwarder.channel_capacity = 64;
    config
}

/// What the fake node does once a stream request for a partition arrives.
#[derive(Debug, Clone)]
pub enum Script {
    /// Sends the frames, then STREAM_END.
    Frames(Vec<Packet>),
    /// Sends the frames, then closes the connection.
    FramesThenHangUp(Vec<Packet>),
}

/// A single-bucket KV node speaking just enough of the binary protocol for
/// the forwarder: auth, bucket selection, cluster config and DCP streams.
pub struct FakeKvNode {
    pub address: String,
    state: Arc<NodeState>,
}

struct NodeState {
    bucket: String,
    partitions: u16,
    /// Server list index of each partition's active node; 0 is this node.
    owners: Vec<usize>,
    peers: Vec<String>,
    open_dcp_connections: AtomicUsize,
    high_seqno: u64,
    vbucket_uuid: u64,
    scripts: Mutex<Vec<(u16, Script)>>,
    stream_requests: Mutex<Vec<StreamRequest>>,
    dcp_names: Mutex<Vec<String>>,
    sasl_users: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub partition: u16,
    pub start_seqno: u64,
    pub vbucket_uuid: u64,
}

impl FakeKvNode {
    pub async fn start(bucket: &str, partitions: u16, scripts: Vec<(u16, Script)>) -> Self {
        Self::start_with_peers(bucket, vec![0; partitions as usize], Vec::new(), scripts).await
    }

    /// Starts a node whose cluster map also lists `peers`. `owners[p]` is the
    /// server list index of partition `p`: 0 is this node, `i` is `peers[i - 1]`.
    pub async fn start_with_peers(
        bucket: &str,
        owners: Vec<usize>,
        peers: Vec<String>,
        scripts: Vec<(u16, Script)>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(NodeState {
            bucket: bucket.to_string(),
            partitions: owners.len() as u16,
            owners,
            peers,
            open_dcp_connections: AtomicUsize::new(0),
            high_seqno: 5,
            vbucket_uuid: 0xfeed_beef,
            scripts: Mutex::new(scripts),
            stream_requests: Mutex::new(Vec::new()),
            dcp_names: Mutex::new(Vec::new()),
            sasl_users: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, accept_state.clone(), port));
            }
        });

        Self { address, state }
    }

    pub fn stream_requests(&self) -> Vec<StreamRequest> {
        let mut requests = self.state.stream_requests.lock().unwrap().clone();
        requests.sort_by_key(|r| r.partition);
        requests
    }

    pub fn dcp_names(&self) -> Vec<String> {
        self.state.dcp_names.lock().unwrap().clone()
    }

    pub fn sasl_users(&self) -> Vec<String> {
        self.state.sasl_users.lock().unwrap().clone()
    }

    /// Connections that opened a DCP stream and are still up.
    pub fn open_dcp_connections(&self) -> usize {
        self.state.open_dcp_connections.load(Ordering::SeqCst)
    }

    pub fn high_seqno(&self) -> u64 {
        self.state.high_seqno
    }

    pub fn vbucket_uuid(&self) -> u64 {
        self.state.vbucket_uuid
    }
}

/// Counts a DCP connection as open until the serving task ends.
struct DcpConnectionGuard(Arc<NodeState>);

impl DcpConnectionGuard {
    fn new(state: &Arc<NodeState>) -> Self {
        state.open_dcp_connections.fetch_add(1, Ordering::SeqCst);
        Self(state.clone())
    }
}

impl Drop for DcpConnectionGuard {
    fn drop(&mut self) {
        self.0.open_dcp_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve(mut socket: TcpStream, state: Arc<NodeState>, port: u16) {
    let mut buf = BytesMut::new();
    let mut dcp_guard: Option<DcpConnectionGuard> = None;
    loop {
        let packet = loop {
            match Packet::decode(&mut buf) {
                Ok(Some(packet)) => break packet,
                Ok(None) => {}
                Err(_) => return,
            }
            match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };

        if packet.is_response() {
            continue; // noop replies
        }

        let ok = Packet::response(packet.opcode, status::SUCCESS, packet.opaque);
        let reply = match packet.opcode {
            opcode::SASL_AUTH => {
                let user = packet.value.split(|b| *b == 0).nth(1).unwrap_or_default();
                state
                    .sasl_users
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(user).into_owned());
                ok
            }
            opcode::SELECT_BUCKET if packet.key == state.bucket.as_bytes() => ok,
            opcode::SELECT_BUCKET => {
                Packet::response(packet.opcode, status::KEY_NOT_FOUND, packet.opaque)
            }
            opcode::GET_CLUSTER_CONFIG => ok.with_value(cluster_config(&state, port)),
            opcode::DCP_OPEN => {
                state
                    .dcp_names
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&packet.key).into_owned());
                dcp_guard.get_or_insert_with(|| DcpConnectionGuard::new(&state));
                ok
            }
            opcode::GET_ALL_VB_SEQNOS => {
                let mut value = BytesMut::new();
                for partition in 0..state.partitions {
                    value.put_u16(partition);
                    value.put_u64(state.high_seqno);
                }
                ok.with_value(value.freeze())
            }
            opcode::DCP_GET_FAILOVER_LOG => {
                let mut value = BytesMut::new();
                value.put_u64(state.vbucket_uuid);
                value.put_u64(0);
                ok.with_value(value.freeze())
            }
            opcode::DCP_STREAM_REQ => {
                let extras = &packet.extras;
                state.stream_requests.lock().unwrap().push(StreamRequest {
                    partition: packet.vbucket,
                    start_seqno: u64::from_be_bytes(extras[8..16].try_into().unwrap()),
                    vbucket_uuid: u64::from_be_bytes(extras[24..32].try_into().unwrap()),
                });
                if socket.write_all(&ok.encode()).await.is_err() {
                    return;
                }
                if !play_script(&mut socket, &state, packet.vbucket, packet.opaque).await {
                    return;
                }
                continue;
            }
            _ => Packet::response(packet.opcode, status::NOT_SUPPORTED, packet.opaque),
        };

        if socket.write_all(&reply.encode()).await.is_err() {
            return;
        }
    }
}

/// Returns false once the connection should be dropped.
async fn play_script(
    socket: &mut TcpStream,
    state: &NodeState,
    partition: u16,
    opaque: u32,
) -> bool {
    let script = {
        let scripts = state.scripts.lock().unwrap();
        scripts
            .iter()
            .find(|(p, _)| *p == partition)
            .map(|(_, script)| script.clone())
    };

    let (frames, hang_up) = match script {
        Some(Script::Frames(frames)) => (frames, false),
        Some(Script::FramesThenHangUp(frames)) => (frames, true),
        None => (Vec::new(), false),
    };

    for frame in frames {
        let frame = frame.with_vbucket(partition).with_opaque(opaque);
        if socket.write_all(&frame.encode()).await.is_err() {
            return false;
        }
    }

    if hang_up {
        // let the frames reach the client before the close
        tokio::time::sleep(Duration::from_millis(50)).await;
        return false;
    }

    let mut extras = BytesMut::new();
    extras.put_u32(0);
    let end = Packet::request(opcode::DCP_STREAM_END)
        .with_vbucket(partition)
        .with_opaque(opaque)
        .with_extras(extras.freeze());
    socket.write_all(&end.encode()).await.is_ok()
}

fn cluster_config(state: &NodeState, port: u16) -> Bytes {
    let servers: Vec<String> = std::iter::once(format!("$HOST:{}", port))
        .chain(state.peers.iter().cloned())
        .collect();
    let vbucket_map: Vec<Vec<usize>> = state.owners.iter().map(|owner| vec![*owner]).collect();
    let config = serde_json::json!({
        "rev": 1,
        "name": state.bucket,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 0,
            "serverList": servers,
            "vBucketMap": vbucket_map,
        }
    });
    Bytes::from(config.to_string())
}

/// A node that accepts connections and never answers on them.
pub struct SilentNode {
    pub address: String,
}

impl SilentNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        Self { address }
    }
}

pub fn mutation_frame(key: &str, cas: u64, seqno: u64, body: &str) -> Packet {
    let mut extras = BytesMut::new();
    extras.put_u64(seqno); // by_seqno
    extras.put_u64(1); // rev_seqno
    extras.put_u32(0); // flags
    extras.put_u32(0); // expiration
    extras.put_u32(0); // lock time
    extras.put_u16(0); // nmeta
    extras.put_u8(0); // nru
    Packet::request(opcode::DCP_MUTATION)
        .with_cas(cas)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key.as_bytes()))
        .with_value(Bytes::copy_from_slice(body.as_bytes()))
}

pub fn deletion_frame(key: &str, cas: u64, seqno: u64) -> Packet {
    let mut extras = BytesMut::new();
    extras.put_u64(seqno);
    extras.put_u64(2);
    extras.put_u16(0);
    Packet::request(opcode::DCP_DELETION)
        .with_cas(cas)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(key.as_bytes()))
}

pub fn snapshot_marker_frame(start: u64, end: u64) -> Packet {
    let mut extras = BytesMut::new();
    extras.put_u64(start);
    extras.put_u64(end);
    extras.put_u32(1);
    Packet::request(opcode::DCP_SNAPSHOT_MARKER).with_extras(extras.freeze())
}

/// Keeps every published message in memory.
#[derive(Default)]
pub struct MemoryPublisher {
    topic: String,
    messages: Mutex<Vec<(String, String)>>,
}

impl MemoryPublisher {
    pub fn new(topic: &str) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.to_string(),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.messages.lock().unwrap().push((
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
