use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broker::{BrokerClient, ProducerTopicConfig};
use crate::codec::Codec;
use crate::error::{ConnectorError, ProduceError};
use crate::metrics_consts::{MESSAGES_PRODUCED, PRODUCE_FAILURES};

/// Publishes single messages through the broker client's per-topic writers.
///
/// There is no retry here: librdkafka already retries until its message
/// timeout, and anything that reaches this layer is handed back to the caller.
pub struct Publisher {
    broker: Arc<dyn BrokerClient>,
    codec: Arc<dyn Codec>,
    client_id: String,
}

impl Publisher {
    pub fn new(broker: Arc<dyn BrokerClient>, codec: Arc<dyn Codec>, client_id: String) -> Self {
        Self {
            broker,
            codec,
            client_id,
        }
    }

    pub async fn publish(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        key: Option<&str>,
        value: &Value,
    ) -> Result<(), ConnectorError> {
        if topic.trim().is_empty() {
            return Err(ProduceError::EmptyTopic.into());
        }
        if ctx.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }

        let payload = self.codec.encode(value).map_err(ProduceError::from)?;

        let produce = async {
            let writer = self
                .broker
                .writer(ProducerTopicConfig {
                    client_id: self.client_id.clone(),
                    topic: topic.to_owned(),
                })
                .await?;
            writer.write(key, &payload).await
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ConnectorError::Cancelled),
            result = produce => result,
        };

        match result {
            Ok(()) => {
                debug!(topic, codec = self.codec.name(), "produced message");
                metrics::counter!(MESSAGES_PRODUCED, "topic" => topic.to_owned()).increment(1);
                Ok(())
            }
            Err(e) => {
                error!(topic, error = %e, "failed to produce message");
                metrics::counter!(PRODUCE_FAILURES, "topic" => topic.to_owned()).increment(1);
                Err(ProduceError::Broker(e).into())
            }
        }
    }
}
