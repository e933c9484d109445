use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors raised by a `BrokerClient` and the sessions it hands out.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    ProduceCanceled,
    #[error("broker client is closed")]
    Closed,
}

/// Errors raised by a `Codec` while turning payloads into bytes and back.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to serialize: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("payload is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("{codec} codec cannot encode a {kind} value")]
    Unsupported { codec: &'static str, kind: &'static str },
    #[error("received empty payload")]
    Empty,
}

/// Errors raised while acquiring a broker client.
///
/// This is `Clone` so the registry can hand the same failure back to every
/// caller of a shared client until it is reset.
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("failed to create kafka client: {0}")]
    Kafka(#[from] KafkaError),
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("topic name must not be empty")]
    EmptyTopic,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("failed to subscribe to topic {topic} for group {group_id}: {error}")]
    Subscribe {
        topic: String,
        group_id: String,
        error: BrokerError,
    },
    #[error("failed to read from topic {topic}: {error}")]
    Read { topic: String, error: BrokerError },
    #[error("failed to decode message at {topic}/{partition}@{offset}: {error}")]
    Decode {
        topic: String,
        partition: i32,
        offset: i64,
        error: CodecError,
    },
    #[error("failed to acknowledge message at {topic}/{partition}@{offset}: {error}")]
    Ack {
        topic: String,
        partition: i32,
        offset: i64,
        error: BrokerError,
    },
    #[error("handler failed for message at {topic}/{partition}@{offset}: {error:#}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        error: anyhow::Error,
    },
    #[error("worker lane panicked: {0}")]
    LanePanicked(String),
}

/// The error returned by every public operation of this crate.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("not supported provider: {0}")]
    UnsupportedProvider(String),
    #[error("at least one bootstrap server is required")]
    NoBootstrapServers,
    #[error("failed to connect: {0}")]
    Connect(#[from] ConnectError),
    #[error("failed to produce message: {0}")]
    Produce(#[from] ProduceError),
    #[error("failed to consume messages: {0}")]
    Consume(#[from] ConsumeError),
    #[error("failed to close client: {0}")]
    Close(#[source] BrokerError),
    #[error("operation was cancelled")]
    Cancelled,
}
