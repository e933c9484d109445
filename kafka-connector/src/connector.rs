//! Provider facade: the entry point applications use to produce and consume.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{BrokerClient, BrokerFactory, ConsumerTopicConfig};
use crate::codec::{Codec, JsonCodec};
use crate::config::Config;
use crate::consumer::{ConsumerOptions, ConsumptionEngine, MessageHandler};
use crate::error::{CodecError, ConnectorError, ProduceError};
use crate::kafka::KafkaBrokerFactory;
use crate::producer::Publisher;
use crate::registry::ConnectionRegistry;

/// The contract every provider implementation fulfils.
#[async_trait]
pub trait KafkaConnector: Send + Sync {
    async fn produce_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &Value,
    ) -> Result<(), ConnectorError>;

    /// Like `produce_message`, with an explicit key deciding the partition.
    async fn produce_keyed_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        key: &str,
        message: &Value,
    ) -> Result<(), ConnectorError>;

    /// Blocks until the session ends: shutdown, cancellation of `ctx`, or a fatal error.
    async fn consume_messages(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConnectorError>;

    async fn close(&self) -> Result<(), ConnectorError>;
}

/// Connector over any `BrokerClient`. Holds a handle to the client, never sole ownership
/// of a shared one.
pub struct BrokerConnector {
    config: Config,
    broker: Arc<dyn BrokerClient>,
    codec: Arc<dyn Codec>,
    publisher: Publisher,
    options: ConsumerOptions,
}

impl BrokerConnector {
    pub fn new(
        config: Config,
        broker: Arc<dyn BrokerClient>,
        codec: Arc<dyn Codec>,
        options: ConsumerOptions,
    ) -> Self {
        let publisher = Publisher::new(broker.clone(), codec.clone(), config.client_id.clone());
        Self {
            config,
            broker,
            codec,
            publisher,
            options,
        }
    }
}

#[async_trait]
impl KafkaConnector for BrokerConnector {
    async fn produce_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &Value,
    ) -> Result<(), ConnectorError> {
        self.publisher.publish(ctx, topic, None, message).await
    }

    async fn produce_keyed_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        key: &str,
        message: &Value,
    ) -> Result<(), ConnectorError> {
        self.publisher.publish(ctx, topic, Some(key), message).await
    }

    async fn consume_messages(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConnectorError> {
        let engine =
            ConsumptionEngine::new(self.broker.clone(), self.codec.clone(), self.options.clone());
        let topic_config = ConsumerTopicConfig {
            client_id: self.config.client_id.clone(),
            group_id: group_id.to_owned(),
            topic: topic.to_owned(),
            offset_reset: self.options.offset_reset,
        };
        engine.run(ctx, topic_config, handler).await
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.broker.close().await.map_err(ConnectorError::Close)
    }
}

/// Assembles a `Client`. Anything not set falls back to the process-wide
/// registry, the provider's own broker factory, JSON and default consumer options.
pub struct ClientBuilder {
    config: Config,
    registry: Option<Arc<ConnectionRegistry>>,
    factory: Option<Arc<dyn BrokerFactory>>,
    codec: Arc<dyn Codec>,
    options: ConsumerOptions,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: None,
            factory: None,
            codec: Arc::new(JsonCodec),
            options: ConsumerOptions::default(),
        }
    }

    /// Resolve shared clients through this registry instead of the global one.
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn BrokerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Client, ConnectorError> {
        self.config.validate()?;

        // validate() leaves rdkafka as the only provider
        let factory: Arc<dyn BrokerFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(KafkaBrokerFactory),
        };

        let broker = match &self.registry {
            Some(registry) => registry.resolve(&self.config, factory.as_ref())?,
            None => ConnectionRegistry::global().resolve(&self.config, factory.as_ref())?,
        };

        info!(
            provider = %self.config.provider,
            client_id = %self.config.client_id,
            shared = self.config.use_global_client,
            codec = self.codec.name(),
            "created kafka connector"
        );

        let connector = BrokerConnector::new(
            self.config.clone(),
            broker.clone(),
            self.codec,
            self.options,
        );
        Ok(Client {
            config: self.config,
            broker,
            connector: Box::new(connector),
        })
    }
}

/// Creates a client for `config` through the process-wide connection registry.
pub fn new_client(config: Config) -> Result<Client, ConnectorError> {
    ClientBuilder::new(config).build()
}

/// Application-facing handle. Every operation delegates to the provider's connector.
pub struct Client {
    config: Config,
    broker: Arc<dyn BrokerClient>,
    connector: Box<dyn KafkaConnector>,
}

impl Client {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The broker client this handle resolved to. Shared-mode handles return the same instance.
    pub fn broker(&self) -> Arc<dyn BrokerClient> {
        self.broker.clone()
    }

    pub async fn produce_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &Value,
    ) -> Result<(), ConnectorError> {
        self.connector.produce_message(ctx, topic, message).await
    }

    pub async fn produce_keyed_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        key: &str,
        message: &Value,
    ) -> Result<(), ConnectorError> {
        self.connector
            .produce_keyed_message(ctx, topic, key, message)
            .await
    }

    /// Serializes any `Serialize` value and produces it.
    pub async fn produce<T: Serialize + ?Sized>(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        message: &T,
    ) -> Result<(), ConnectorError> {
        let value = serde_json::to_value(message)
            .map_err(|e| ProduceError::Codec(CodecError::Serialize(e)))?;
        self.produce_message(ctx, topic, &value).await
    }

    pub async fn consume_messages<H: MessageHandler>(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        group_id: &str,
        handler: H,
    ) -> Result<(), ConnectorError> {
        self.connector
            .consume_messages(ctx, topic, group_id, Arc::new(handler))
            .await
    }

    /// Releases the broker client. For a shared client this closes it for every holder.
    pub async fn close(&self) -> Result<(), ConnectorError> {
        self.connector.close().await
    }
}
