use rdkafka::error::KafkaError;
use thiserror::Error;
use vbus_common::specification::DecodingError;

/// Failures establishing one of the exporter's upstream or downstream connections.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to connect to record stream at {address}: {error}")]
    Stream {
        address: String,
        error: std::io::Error,
    },
    #[error("failed to connect to kafka brokers: {0}")]
    Broker(#[from] KafkaError),
    #[error("kafka connection task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures turning the consolidated headers into an export payload.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to decode packet fields: {0}")]
    Decoding(#[from] DecodingError),
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to produce message: {0}")]
    Produce(KafkaError),
    #[error("message delivery was cancelled before an acknowledgement")]
    Cancelled,
}
