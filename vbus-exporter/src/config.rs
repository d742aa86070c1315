use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use vbus_common::mapping::OutputMapping;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8083")]
    pub port: u16,

    /// Address of the newline-delimited JSON record feed.
    #[envconfig(default = "127.0.0.1:7053")]
    pub stream_address: String,

    /// Timer interval of the consolidator backing `GET /`.
    #[envconfig(default = "10000")]
    pub logging_interval: EnvMsDuration,

    /// Retention window of the consolidator backing `GET /` and publishing.
    #[envconfig(default = "60000")]
    pub logging_time_to_live: EnvMsDuration,

    /// Zero disables publishing.
    #[envconfig(default = "10000")]
    pub publish_interval: EnvMsDuration,

    #[envconfig(default = "false")]
    pub publish_fire_immediately: bool,

    /// Log payloads instead of producing them to Kafka.
    #[envconfig(default = "false")]
    pub print_sink: bool,

    /// JSON decoding table, the built-in one is used when unset.
    pub specification_path: Option<String>,

    #[envconfig(
        default = r#"{"temp1":"00_0010_4278_10_0100_000_2_0","temp2":"00_0010_4278_10_0100_002_2_0","relay1":"00_0010_4278_10_0100_008_1_0","relay1hrs":"00_0010_4278_10_0100_012_2_0"}"#
    )]
    pub field_map: OutputMapping,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "resol")]
    pub kafka_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

impl EnvMsDuration {
    /// `None` for a zero duration, which disables the feature it configures.
    pub fn enabled(&self) -> Option<time::Duration> {
        Some(self.0).filter(|duration| !duration.is_zero())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
