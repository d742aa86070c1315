use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{error, info};

use crate::config::KafkaConfig;
use crate::error::{ConnectionError, PublishError};
use crate::kafka_producer::{create_kafka_producer, KafkaContext};

/// Destination of the periodic output parameter messages.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, payload: String) -> Result<(), PublishError>;
}

pub struct PrintSink {}

#[async_trait]
impl PublishSink for PrintSink {
    async fn publish(&self, payload: String) -> Result<(), PublishError> {
        info!("publish: {}", payload);
        metrics::counter!("vbus_messages_published_total").increment(1);
        Ok(())
    }
}

/// Produces every payload to one topic over a single long-lived producer.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    /// Creates the producer on the calling thread. Blocks while the cluster
    /// is pinged, use [`connect`](Self::connect) from async code.
    pub fn new(config: &KafkaConfig) -> Result<KafkaSink, ConnectionError> {
        let producer = create_kafka_producer(config)?;
        Ok(KafkaSink {
            producer,
            topic: config.kafka_topic.clone(),
        })
    }

    /// Same as [`new`](Self::new), with the ping moved to the blocking pool.
    pub async fn connect(config: KafkaConfig) -> Result<KafkaSink, ConnectionError> {
        tokio::task::spawn_blocking(move || KafkaSink::new(&config)).await?
    }
}

#[async_trait]
impl PublishSink for KafkaSink {
    async fn publish(&self, payload: String) -> Result<(), PublishError> {
        let record = FutureRecord::<(), str>::to(&self.topic).payload(payload.as_str());

        let delivery = self.producer.send_result(record).map_err(|(err, _)| {
            error!("failed to produce message: {}", err);
            metrics::counter!("vbus_publish_errors_total").increment(1);
            PublishError::Produce(err)
        })?;

        match delivery.await {
            Err(_) => {
                metrics::counter!("vbus_publish_errors_total").increment(1);
                Err(PublishError::Cancelled)
            }
            Ok(Err((err, _))) => {
                metrics::counter!("vbus_publish_errors_total").increment(1);
                Err(PublishError::Produce(err))
            }
            Ok(Ok(_)) => {
                metrics::counter!("vbus_messages_published_total").increment(1);
                Ok(())
            }
        }
    }
}
