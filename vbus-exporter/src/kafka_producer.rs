use std::time::Duration;

use metrics::gauge;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use crate::config::KafkaConfig;

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("vbus_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("vbus_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("vbus_kafka_callback_queue_depth").set(stats.replyq as f64);
    }
}

/// Creates the producer shared by every publish tick and pings the cluster
/// so an unreachable broker is reported at startup.
pub fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // Fail after 10 seconds if no broker answers
    drop(producer.client().fetch_metadata(
        Some("__consumer_offsets"),
        Timeout::After(Duration::new(10, 0)),
    )?);
    info!("connected to Kafka brokers");

    Ok(producer)
}
