use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{FailureSlot, HandlerErrorPolicy, MessageHandler};
use crate::broker::{Message, TopicReader};
use crate::codec::Codec;
use crate::error::ConsumeError;
use crate::metrics_consts::{
    DECODE_FAILURES, HANDLER_FAILURES, HANDLER_RETRIES, MESSAGES_HANDLED, MESSAGES_SKIPPED,
};

/// One worker lane. Handles the records routed to it strictly one after another.
pub(crate) struct Lane {
    pub(crate) id: usize,
    pub(crate) reader: Arc<dyn TopicReader>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) error_policy: HandlerErrorPolicy,
    /// Handed to the handler. Only the caller cancels it.
    pub(crate) ctx: CancellationToken,
    pub(crate) stop: CancellationToken,
    pub(crate) failure: Arc<FailureSlot>,
}

enum Outcome {
    Done,
    // Stopped between attempts; the record stays unacknowledged
    Interrupted,
}

impl Lane {
    pub(crate) async fn run(self, mut receiver: mpsc::Receiver<Message>) {
        debug!(lane = self.id, "worker lane started");

        loop {
            let message = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                received = receiver.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            };

            match self.process(&message).await {
                Ok(Outcome::Done) => {}
                Ok(Outcome::Interrupted) => break,
                Err(e) => {
                    error!(lane = self.id, error = %e, "aborting consumer session");
                    self.failure.record(e);
                    self.stop.cancel();
                    break;
                }
            }
        }

        debug!(lane = self.id, "worker lane stopped");
    }

    async fn process(&self, message: &Message) -> Result<Outcome, ConsumeError> {
        let value = match self.codec.decode(message.payload()) {
            Ok(value) => value,
            Err(error) => {
                metrics::counter!(DECODE_FAILURES, "topic" => message.topic.clone()).increment(1);
                if self.error_policy == HandlerErrorPolicy::Skip {
                    warn!(
                        lane = self.id,
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %error,
                        "skipping message that failed to decode"
                    );
                    metrics::counter!(MESSAGES_SKIPPED, "topic" => message.topic.clone())
                        .increment(1);
                    self.ack(message)?;
                    return Ok(Outcome::Done);
                }
                return Err(ConsumeError::Decode {
                    topic: message.topic.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    error,
                });
            }
        };

        match &self.error_policy {
            HandlerErrorPolicy::Abort => {
                self.invoke(message, value).await?;
            }
            HandlerErrorPolicy::Skip => {
                if let Err(e) = self.invoke(message, value).await {
                    warn!(lane = self.id, error = %e, "skipping message after handler failure");
                    metrics::counter!(MESSAGES_SKIPPED, "topic" => message.topic.clone())
                        .increment(1);
                }
            }
            HandlerErrorPolicy::Retry {
                max_attempts,
                policy,
            } => {
                let max_attempts = (*max_attempts).max(1);
                let mut attempt = 1;
                loop {
                    match self.invoke(message, value.clone()).await {
                        Ok(()) => break,
                        Err(e) if attempt >= max_attempts => return Err(e),
                        Err(e) => {
                            let backoff = policy.time_until_next_retry(attempt - 1);
                            warn!(
                                lane = self.id,
                                attempt,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "handler failed, retrying"
                            );
                            metrics::counter!(HANDLER_RETRIES, "topic" => message.topic.clone())
                                .increment(1);

                            tokio::select! {
                                biased;
                                _ = self.stop.cancelled() => return Ok(Outcome::Interrupted),
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            attempt += 1;
                        }
                    }
                }
            }
        }

        self.ack(message)?;
        Ok(Outcome::Done)
    }

    async fn invoke(&self, message: &Message, value: Value) -> Result<(), ConsumeError> {
        debug!(
            lane = self.id,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "handling message"
        );

        match self.handler.handle(self.ctx.clone(), value).await {
            Ok(()) => {
                metrics::counter!(MESSAGES_HANDLED, "topic" => message.topic.clone()).increment(1);
                Ok(())
            }
            Err(error) => {
                metrics::counter!(HANDLER_FAILURES, "topic" => message.topic.clone()).increment(1);
                Err(ConsumeError::Handler {
                    topic: message.topic.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    error,
                })
            }
        }
    }

    fn ack(&self, message: &Message) -> Result<(), ConsumeError> {
        self.reader.ack(message).map_err(|error| ConsumeError::Ack {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            error,
        })
    }
}
