//! Error types and result handling for cb-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use cb_capture::{Error, Result};
//!
//! fn open_bucket() -> Result<()> {
//!     Err(Error::BucketNotFound("travel-sample".to_string()))
//! }
//!
//! match open_bucket() {
//!     Ok(()) => println!("Bucket open"),
//!     Err(Error::BucketNotFound(name)) => eprintln!("No such bucket: {}", name),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for cb-capture operations.
///
/// Setup failures (`Connection`, `Authentication`, `Timeout`, `BucketNotFound`,
/// `Config`) and stream failures (`Stream`) end a forwarding run. Encoding
/// failures are handled inside the forwarder and never abort it.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file, environment or a
    /// malformed cluster configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on a cluster connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not reach or talk to a cluster node.
    #[error("Connection error: {0}")]
    Connection(String),

    /// SASL authentication or bucket access was rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The server answered with an unexpected status or frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The cluster does not know the requested bucket.
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Opening the change stream of a single partition failed.
    #[error("Failed to open stream for partition {partition}: {message}")]
    PartitionOpen {
        /// Partition (vbucket) index
        partition: u16,
        /// Description of the failure
        message: String,
    },

    /// An already open partition stream broke.
    #[error("Stream for partition {partition} failed: {message}")]
    Stream {
        /// Partition (vbucket) index
        partition: u16,
        /// Description of the failure
        message: String,
    },

    /// Invalid or malformed frame received from the cluster.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Returns true for failures that happen before any event can flow.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Authentication(_)
                | Error::Timeout { .. }
                | Error::BucketNotFound(_)
                | Error::Config(_)
        )
    }
}

/// A convenient Result type alias for cb-capture operations.
///
/// This is equivalent to `std::result::Result<T, cb_capture::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
