//! The capability surface this crate needs from a broker client library.
//!
//! Everything above this module (registry, producer path, consumption engine)
//! talks to brokers only through these traits, so the rdkafka client and the
//! in-process one are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::consumer::OffsetReset;
use crate::error::{BrokerError, ConnectError};

/// A consumed record, detached from the client that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl Message {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerTopicConfig {
    pub client_id: String,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerTopicConfig {
    pub client_id: String,
    pub group_id: String,
    pub topic: String,
    pub offset_reset: OffsetReset,
}

#[async_trait]
pub trait TopicWriter: Send + Sync {
    async fn write(&self, key: Option<&str>, payload: &[u8]) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait TopicReader: Send + Sync {
    /// Waits for the next record. Dropping the future must not lose a record.
    async fn recv(&self) -> Result<Message, BrokerError>;

    /// Marks a record as processed. The reader decides when that becomes a committed position.
    fn ack(&self, message: &Message) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Returns the writer session for a topic, creating and caching it on first use.
    async fn writer(
        &self,
        config: ProducerTopicConfig,
    ) -> Result<Arc<dyn TopicWriter>, BrokerError>;

    /// Opens a group-member reader subscribed to one topic.
    async fn reader(
        &self,
        config: ConsumerTopicConfig,
    ) -> Result<Arc<dyn TopicReader>, BrokerError>;

    /// Releases every session. Calling it again is a no-op.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Builds broker clients for the connection registry.
pub trait BrokerFactory: Send + Sync {
    fn connect(&self, config: &Config) -> Result<Arc<dyn BrokerClient>, ConnectError>;
}

/// Whether two handles point at the same broker client instance.
pub fn same_client(a: &Arc<dyn BrokerClient>, b: &Arc<dyn BrokerClient>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
