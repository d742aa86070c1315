pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod kafka_producer;
pub mod publisher;
pub mod render;
pub mod sink;
pub mod source;
