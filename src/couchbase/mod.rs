pub mod client;
pub mod connection;
pub mod gateway;
pub mod protocol;
pub mod streams;
pub mod types;

pub use client::CouchbaseClient;
pub use connection::KvConnection;
pub use gateway::{ClusterClient, ClusterGateway, PartitionStream};
pub use protocol::{DcpMessage, Packet};
pub use streams::{PartitionEvents, PartitionStreamManager};
pub use types::*;
