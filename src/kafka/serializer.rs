use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::warn;

use crate::couchbase::ChangeEvent;
use crate::Result;

/// Canonical wire form of a change event.
#[derive(Serialize)]
#[serde(tag = "event")]
enum WireMessage<'a> {
    #[serde(rename = "mutation")]
    Mutation {
        key: &'a str,
        expiration: u32,
        flags: u32,
        cas: u64,
        #[serde(rename = "lockTime")]
        lock_time: u32,
        /// Document body copied verbatim once it parses as JSON.
        content: &'a RawValue,
    },
    #[serde(rename = "remove")]
    Removal { key: &'a str, cas: u64 },
}

/// Record written to the dead-letter topic for events that could not be
/// encoded.
#[derive(Serialize)]
struct DeadLetter<'a> {
    event: &'static str,
    key: &'a str,
    cas: u64,
    error: String,
    content_base64: String,
}

/// Encodes change events as compact JSON objects.
///
/// ```rust
/// use cb_capture::couchbase::ChangeEvent;
/// use cb_capture::kafka::JsonEncoder;
///
/// let event = ChangeEvent::Removal { key: "doc2".to_string(), cas: 42 };
/// let payload = JsonEncoder::new().encode(&event);
/// assert_eq!(payload, br#"{"event":"remove","key":"doc2","cas":42}"#);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encodes `event`, returning an empty payload if the document body is
    /// not valid JSON. An empty payload is never published.
    pub fn encode(&self, event: &ChangeEvent) -> Vec<u8> {
        match self.try_encode(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    key = %event.key(),
                    cas = event.cas(),
                    "Error while encoding change event: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    pub fn try_encode(&self, event: &ChangeEvent) -> Result<Vec<u8>> {
        let message = match event {
            ChangeEvent::Mutation {
                key,
                expiration,
                flags,
                cas,
                lock_time,
                content,
            } => WireMessage::Mutation {
                key,
                expiration: *expiration,
                flags: *flags,
                cas: *cas,
                lock_time: *lock_time,
                content: serde_json::from_slice::<&RawValue>(content)?,
            },
            ChangeEvent::Removal { key, cas } => WireMessage::Removal { key, cas: *cas },
        };

        Ok(serde_json::to_vec(&message)?)
    }

    /// Builds the dead-letter record for an event whose encoding failed.
    pub fn dead_letter(&self, event: &ChangeEvent, error: &crate::Error) -> Result<Vec<u8>> {
        let content = match event {
            ChangeEvent::Mutation { content, .. } => STANDARD.encode(content),
            ChangeEvent::Removal { .. } => String::new(),
        };

        let record = DeadLetter {
            event: event.kind(),
            key: event.key(),
            cas: event.cas(),
            error: error.to_string(),
            content_base64: content,
        };
        Ok(serde_json::to_vec(&record)?)
    }
}
