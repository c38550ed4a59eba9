//! Forwards the change stream of a Couchbase bucket into a Kafka topic.
//!
//! The [`Forwarder`] connects to the cluster, subscribes to every partition
//! of the bucket, encodes each change as JSON and publishes it keyed by the
//! document key.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod stats;

pub mod couchbase;
pub mod kafka;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use error::{Error, Result};
pub use forwarder::{Forwarder, ForwarderState, RunSummary};
