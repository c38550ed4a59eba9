pub mod producer;
pub mod serializer;


pub use producer::{KafkaPublisher, Publisher};
pub use serializer::JsonEncoder;
