//! Memcached binary protocol framing and DCP message decoding.
//!
//! Every frame is a 24 byte header followed by extras, key and value:
//!
//! ```text
//!  0      1      2..4        4       5         6..8            8..12      12..16  16..24
//! magic opcode  key length  extlen  datatype  vbucket/status  body len   opaque  cas
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::trace;

use super::types::ChangeEvent;
use crate::{Error, Result};

pub const HEADER_LEN: usize = 24;
pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Frames larger than this are treated as corruption.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

pub mod opcode {
    pub const SASL_AUTH: u8 = 0x21;
    pub const GET_ALL_VB_SEQNOS: u8 = 0x48;
    pub const DCP_OPEN: u8 = 0x50;
    pub const DCP_STREAM_REQ: u8 = 0x53;
    pub const DCP_GET_FAILOVER_LOG: u8 = 0x54;
    pub const DCP_STREAM_END: u8 = 0x55;
    pub const DCP_SNAPSHOT_MARKER: u8 = 0x56;
    pub const DCP_MUTATION: u8 = 0x57;
    pub const DCP_DELETION: u8 = 0x58;
    pub const DCP_EXPIRATION: u8 = 0x59;
    pub const DCP_NOOP: u8 = 0x5c;
    pub const SELECT_BUCKET: u8 = 0x89;
    pub const GET_CLUSTER_CONFIG: u8 = 0xb5;
}

pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const AUTH_ERROR: u16 = 0x0020;
    pub const ROLLBACK: u16 = 0x0023;
    pub const ACCESS_DENIED: u16 = 0x0024;
    pub const NOT_SUPPORTED: u16 = 0x0083;
}

const DCP_OPEN_PRODUCER: u32 = 0x01;
const VBUCKET_STATE_ACTIVE: u32 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: u8,
    pub opcode: u8,
    pub datatype: u8,
    /// vbucket id on requests, status on responses
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    pub fn request(opcode: u8) -> Self {
        Self {
            magic: MAGIC_REQUEST,
            opcode,
            datatype: 0,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn response(opcode: u8, status: u16, opaque: u32) -> Self {
        Self {
            magic: MAGIC_RESPONSE,
            vbucket: status,
            opaque,
            ..Self::request(opcode)
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RESPONSE
    }

    pub fn status(&self) -> u16 {
        self.vbucket
    }

    pub fn encode(&self) -> Bytes {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(self.vbucket);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Splits one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &buf[..HEADER_LEN];
        let magic = header.get_u8();
        if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
            return Err(Error::InvalidMessage {
                message: format!("Unknown magic byte: 0x{:02x}", magic),
            });
        }
        let opcode = header.get_u8();
        let key_len = header.get_u16() as usize;
        let extras_len = header.get_u8() as usize;
        let datatype = header.get_u8();
        let vbucket = header.get_u16();
        let body_len = header.get_u32() as usize;
        let opaque = header.get_u32();
        let cas = header.get_u64();

        if body_len > MAX_BODY_LEN {
            return Err(Error::InvalidMessage {
                message: format!("Frame body of {} bytes exceeds limit", body_len),
            });
        }
        if extras_len + key_len > body_len {
            return Err(Error::InvalidMessage {
                message: format!(
                    "Extras ({}) and key ({}) exceed body length {}",
                    extras_len, key_len, body_len
                ),
            });
        }
        if buf.len() < HEADER_LEN + body_len {
            buf.reserve(HEADER_LEN + body_len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let mut body = buf.split_to(body_len).freeze();
        let extras = body.split_to(extras_len);
        let key = body.split_to(key_len);

        Ok(Some(Packet {
            magic,
            opcode,
            datatype,
            vbucket,
            opaque,
            cas,
            extras,
            key,
            value: body,
        }))
    }
}

pub fn sasl_plain(username: &str, password: &str) -> Packet {
    let mut value = BytesMut::with_capacity(username.len() + password.len() + 2);
    value.put_u8(0);
    value.put_slice(username.as_bytes());
    value.put_u8(0);
    value.put_slice(password.as_bytes());
    Packet::request(opcode::SASL_AUTH)
        .with_key(Bytes::from_static(b"PLAIN"))
        .with_value(value.freeze())
}

pub fn select_bucket(bucket: &str) -> Packet {
    Packet::request(opcode::SELECT_BUCKET).with_key(Bytes::copy_from_slice(bucket.as_bytes()))
}

pub fn get_cluster_config() -> Packet {
    Packet::request(opcode::GET_CLUSTER_CONFIG)
}

pub fn dcp_open(name: &str) -> Packet {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(0);
    extras.put_u32(DCP_OPEN_PRODUCER);
    Packet::request(opcode::DCP_OPEN)
        .with_extras(extras.freeze())
        .with_key(Bytes::copy_from_slice(name.as_bytes()))
}

pub fn get_all_vb_seqnos() -> Packet {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(VBUCKET_STATE_ACTIVE);
    Packet::request(opcode::GET_ALL_VB_SEQNOS).with_extras(extras.freeze())
}

pub fn failover_log(partition: u16) -> Packet {
    Packet::request(opcode::DCP_GET_FAILOVER_LOG).with_vbucket(partition)
}

/// Open-ended stream request starting after `start_seqno`.
pub fn stream_request(partition: u16, start_seqno: u64, vbucket_uuid: u64) -> Packet {
    let mut extras = BytesMut::with_capacity(48);
    extras.put_u32(0); // flags
    extras.put_u32(0); // reserved
    extras.put_u64(start_seqno);
    extras.put_u64(u64::MAX); // end seqno
    extras.put_u64(vbucket_uuid);
    extras.put_u64(start_seqno); // snapshot start
    extras.put_u64(start_seqno); // snapshot end
    Packet::request(opcode::DCP_STREAM_REQ)
        .with_vbucket(partition)
        .with_extras(extras.freeze())
}

/// Decodes a `GET_ALL_VB_SEQNOS` response body into partition -> high seqno.
pub fn parse_seqnos(mut value: &[u8]) -> Result<HashMap<u16, u64>> {
    if value.len() % 10 != 0 {
        return Err(Error::InvalidMessage {
            message: format!("Sequence number list of {} bytes", value.len()),
        });
    }
    let mut seqnos = HashMap::with_capacity(value.len() / 10);
    while value.has_remaining() {
        let partition = value.get_u16();
        let seqno = value.get_u64();
        seqnos.insert(partition, seqno);
    }
    Ok(seqnos)
}

/// Decodes a failover log into `(vbucket_uuid, seqno)` entries, newest first.
pub fn parse_failover_log(mut value: &[u8]) -> Result<Vec<(u64, u64)>> {
    if value.len() % 16 != 0 {
        return Err(Error::InvalidMessage {
            message: format!("Failover log of {} bytes", value.len()),
        });
    }
    let mut entries = Vec::with_capacity(value.len() / 16);
    while value.has_remaining() {
        let uuid = value.get_u64();
        let seqno = value.get_u64();
        entries.push((uuid, seqno));
    }
    Ok(entries)
}

/// Messages pushed by the server on a DCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcpMessage {
    Change {
        partition: u16,
        by_seqno: u64,
        event: ChangeEvent,
    },
    SnapshotMarker {
        partition: u16,
        start: u64,
        end: u64,
    },
    StreamEnd {
        partition: u16,
        flags: u32,
    },
    Noop,
    Unknown(u8),
}

impl DcpMessage {
    pub fn decode(packet: &Packet) -> Result<DcpMessage> {
        let partition = packet.vbucket;
        match packet.opcode {
            opcode::DCP_MUTATION => decode_mutation(packet),
            opcode::DCP_DELETION | opcode::DCP_EXPIRATION => decode_removal(packet),
            opcode::DCP_SNAPSHOT_MARKER => {
                let mut extras = &packet.extras[..];
                if extras.remaining() < 16 {
                    return Err(Error::InvalidMessage {
                        message: "Invalid SNAPSHOT_MARKER extras size".to_string(),
                    });
                }
                let start = extras.get_u64();
                let end = extras.get_u64();
                trace!(partition, start, end, "snapshot marker");
                Ok(DcpMessage::SnapshotMarker {
                    partition,
                    start,
                    end,
                })
            }
            opcode::DCP_STREAM_END => {
                let mut extras = &packet.extras[..];
                let flags = if extras.remaining() >= 4 {
                    extras.get_u32()
                } else {
                    0
                };
                Ok(DcpMessage::StreamEnd { partition, flags })
            }
            opcode::DCP_NOOP => Ok(DcpMessage::Noop),
            other => Ok(DcpMessage::Unknown(other)),
        }
    }
}

fn decode_key(packet: &Packet) -> Result<String> {
    if packet.key.is_empty() {
        return Err(Error::InvalidMessage {
            message: format!("Empty document key on partition {}", packet.vbucket),
        });
    }
    Ok(String::from_utf8_lossy(&packet.key).into_owned())
}

fn decode_mutation(packet: &Packet) -> Result<DcpMessage> {
    let mut extras = &packet.extras[..];
    if extras.remaining() < 28 {
        return Err(Error::InvalidMessage {
            message: "Invalid MUTATION extras size".to_string(),
        });
    }

    let by_seqno = extras.get_u64();
    let _rev_seqno = extras.get_u64();
    let flags = extras.get_u32();
    let expiration = extras.get_u32();
    let lock_time = extras.get_u32();

    Ok(DcpMessage::Change {
        partition: packet.vbucket,
        by_seqno,
        event: ChangeEvent::Mutation {
            key: decode_key(packet)?,
            expiration,
            flags,
            cas: packet.cas,
            lock_time,
            content: packet.value.clone(),
        },
    })
}

fn decode_removal(packet: &Packet) -> Result<DcpMessage> {
    let mut extras = &packet.extras[..];
    if extras.remaining() < 16 {
        return Err(Error::InvalidMessage {
            message: "Invalid DELETION extras size".to_string(),
        });
    }

    let by_seqno = extras.get_u64();

    Ok(DcpMessage::Change {
        partition: packet.vbucket,
        by_seqno,
        event: ChangeEvent::Removal {
            key: decode_key(packet)?,
            cas: packet.cas,
        },
    })
}

/// Maps a non-success response to an error naming the failed operation.
pub fn check_status(packet: &Packet, operation: &str) -> Result<()> {
    match packet.status() {
        status::SUCCESS => Ok(()),
        status::AUTH_ERROR | status::ACCESS_DENIED => Err(Error::Authentication(format!(
            "{} rejected with status 0x{:04x}",
            operation,
            packet.status()
        ))),
        other => Err(Error::Protocol(format!(
            "{} failed with status 0x{:04x}: {}",
            operation,
            other,
            String::from_utf8_lossy(&packet.value)
        ))),
    }
}
