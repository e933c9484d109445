use std::convert::Infallible;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::consumer::{ConsumerOptions, HandlerErrorPolicy, OffsetReset, RetryPolicy};
use crate::error::ConnectorError;

/// Selects which connector implementation backs a `Client`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Provider {
    /// librdkafka, through the `rdkafka` crate.
    #[default]
    Rdkafka,
    /// A provider name this build does not ship a connector for. `new_client` rejects it.
    Unsupported(String),
}

impl FromStr for Provider {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rdkafka" | "kafka" => Ok(Provider::Rdkafka),
            _ => Ok(Provider::Unsupported(s.to_owned())),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Rdkafka => write!(f, "rdkafka"),
            Provider::Unsupported(name) => write!(f, "{name}"),
        }
    }
}

/// librdkafka tuning applied to every client a connector creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    pub producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    pub producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue
    pub message_timeout_ms: u32, // Time before we stop retrying producing a message
    pub compression_codec: String, // none, gzip, snappy, lz4, zstd
    pub session_timeout_ms: u32,
    pub tls: bool,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            producer_linger_ms: 20,
            producer_queue_mib: 400,
            producer_queue_messages: 10_000_000,
            message_timeout_ms: 20_000,
            compression_codec: "none".to_string(),
            session_timeout_ms: 10_000,
            tls: false,
        }
    }
}

impl KafkaSettings {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.message_timeout_ms))
    }
}

/// Connector configuration. Immutable once handed to `new_client`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Broker addresses, as `host:port`.
    pub bootstrap_servers: Vec<String>,
    pub client_id: String,
    pub provider: Provider,
    /// Share one broker client across every connector in the process.
    pub use_global_client: bool,
    pub kafka: KafkaSettings,
}

impl Config {
    pub fn new<I, S>(bootstrap_servers: I, client_id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bootstrap_servers: bootstrap_servers.into_iter().map(Into::into).collect(),
            client_id: client_id.into(),
            provider: Provider::default(),
            use_global_client: false,
            kafka: KafkaSettings::default(),
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_global_client(mut self, use_global_client: bool) -> Self {
        self.use_global_client = use_global_client;
        self
    }

    pub fn with_kafka_settings(mut self, kafka: KafkaSettings) -> Self {
        self.kafka = kafka;
        self
    }

    /// Checks everything `new_client` must reject before any client is created.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if let Provider::Unsupported(name) = &self.provider {
            return Err(ConnectorError::UnsupportedProvider(name.clone()));
        }
        if self.bootstrap_servers.iter().all(|s| s.trim().is_empty()) {
            return Err(ConnectorError::NoBootstrapServers);
        }
        Ok(())
    }

    /// The `bootstrap.servers` value librdkafka expects.
    pub fn bootstrap_servers_list(&self) -> String {
        self.bootstrap_servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Environment-driven configuration, for services that configure the connector through env vars.
#[derive(Envconfig, Clone)]
pub struct EnvConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Comma separated

    #[envconfig(default = "kafka-connector")]
    pub kafka_client_id: String,

    #[envconfig(default = "rdkafka")]
    pub kafka_provider: Provider,

    #[envconfig(default = "false")]
    pub kafka_use_global_client: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,

    #[envconfig(default = "10000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "5")]
    pub kafka_consumer_lanes: usize,

    #[envconfig(default = "16")]
    pub kafka_consumer_lane_buffer: usize,

    // Only matters the first time a consumer group connects
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: OffsetReset,

    #[envconfig(default = "abort")]
    pub kafka_consumer_error_policy: HandlerErrorPolicy, // abort, skip, retry

    #[envconfig(default = "3")]
    pub kafka_consumer_retry_attempts: u32,

    #[envconfig(default = "100")]
    pub kafka_consumer_retry_initial_interval_ms: u64,

    #[envconfig(default = "10000")]
    pub kafka_consumer_retry_maximum_interval_ms: u64,
}

impl EnvConfig {
    pub fn to_config(&self) -> Config {
        Config::new(self.kafka_hosts.split(','), self.kafka_client_id.clone())
            .with_provider(self.kafka_provider.clone())
            .with_global_client(self.kafka_use_global_client)
            .with_kafka_settings(KafkaSettings {
                producer_linger_ms: self.kafka_producer_linger_ms,
                producer_queue_mib: self.kafka_producer_queue_mib,
                producer_queue_messages: self.kafka_producer_queue_messages,
                message_timeout_ms: self.kafka_message_timeout_ms,
                compression_codec: self.kafka_compression_codec.clone(),
                session_timeout_ms: self.kafka_session_timeout_ms,
                tls: self.kafka_tls,
            })
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        let error_policy = match self.kafka_consumer_error_policy {
            HandlerErrorPolicy::Retry { .. } => HandlerErrorPolicy::Retry {
                max_attempts: self.kafka_consumer_retry_attempts,
                policy: RetryPolicy::new(
                    2,
                    Duration::from_millis(self.kafka_consumer_retry_initial_interval_ms),
                    Some(Duration::from_millis(
                        self.kafka_consumer_retry_maximum_interval_ms,
                    )),
                ),
            },
            ref other => other.clone(),
        };

        ConsumerOptions::default()
            .with_lanes(self.kafka_consumer_lanes)
            .with_lane_buffer(self.kafka_consumer_lane_buffer)
            .with_offset_reset(self.kafka_consumer_offset_reset)
            .with_error_policy(error_policy)
    }
}
