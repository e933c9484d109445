//! Kafka connector: produce and consume topic messages without binding to a
//! client library, with a shared or per-connector broker client and an
//! ordered, lane-parallel consumption engine.

pub mod broker;
pub mod codec;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod metrics_consts;
pub mod offsets;
pub mod producer;
pub mod registry;

pub use codec::{Codec, JsonCodec, StringCodec};
pub use config::{Config, EnvConfig, KafkaSettings, Provider};
pub use connector::{new_client, BrokerConnector, Client, ClientBuilder, KafkaConnector};
pub use consumer::{
    ConsumerOptions, HandlerErrorPolicy, MessageHandler, OffsetReset, OrderingKey, RetryPolicy,
    SessionState, ShutdownSource,
};
pub use error::{ConnectorError, ConsumeError, ProduceError};
pub use registry::{reset_connection, ConnectionRegistry};
