//! rdkafka-backed broker client.
//!
//! One `FutureProducer` per client is shared by the per-topic writers, since
//! librdkafka producers are not bound to a topic. Every reader is its own
//! `StreamConsumer` group member. Offsets are stored explicitly once the
//! tracker releases them and committed by librdkafka's auto-commit.

mod context;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as _};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerClient, BrokerFactory, ConsumerTopicConfig, Message, ProducerTopicConfig, TopicReader,
    TopicWriter,
};
use crate::config::{Config, KafkaSettings};
use crate::error::{BrokerError, ConnectError};
use crate::offsets::OffsetTracker;

pub use context::ReaderContext;

const COMPRESSION_CODECS: [&str; 5] = ["none", "gzip", "snappy", "lz4", "zstd"];

/// Builds `KafkaBroker`s. This is what `new_client` uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaBrokerFactory;

impl BrokerFactory for KafkaBrokerFactory {
    fn connect(&self, config: &Config) -> Result<Arc<dyn BrokerClient>, ConnectError> {
        Ok(Arc::new(KafkaBroker::new(config)?))
    }
}

pub struct KafkaBroker {
    common: ClientConfig,
    settings: KafkaSettings,
    producer: FutureProducer,
    writers: Mutex<HashMap<String, Arc<KafkaWriter>>>,
    // Weak, so a finished session drops its consumer and leaves the group
    readers: Mutex<Vec<Weak<KafkaReader>>>,
    closed: CancellationToken,
}

impl KafkaBroker {
    pub fn new(config: &Config) -> Result<Self, ConnectError> {
        let settings = config.kafka.clone();
        if !COMPRESSION_CODECS.contains(&settings.compression_codec.as_str()) {
            return Err(ConnectError::InvalidConfig(format!(
                "unknown compression codec {}",
                settings.compression_codec
            )));
        }

        let mut common = ClientConfig::new();
        common
            .set("bootstrap.servers", config.bootstrap_servers_list())
            .set("client.id", &config.client_id)
            .set("statistics.interval.ms", "10000");

        if settings.tls {
            common
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let mut producer_config = common.clone();
        producer_config
            .set("linger.ms", settings.producer_linger_ms.to_string())
            .set("message.timeout.ms", settings.message_timeout_ms.to_string())
            .set("compression.codec", settings.compression_codec.to_owned())
            .set(
                "queue.buffering.max.kbytes",
                (settings.producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                settings.producer_queue_messages.to_string(),
            );

        debug!("rdkafka producer configuration: {:?}", producer_config);
        let producer: FutureProducer = producer_config.create()?;

        info!(
            client_id = %config.client_id,
            bootstrap_servers = %config.bootstrap_servers_list(),
            "created kafka broker client"
        );

        Ok(Self {
            common,
            settings,
            producer,
            writers: Mutex::new(HashMap::new()),
            readers: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn writer_cache(&self) -> MutexGuard<'_, HashMap<String, Arc<KafkaWriter>>> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader_list(&self) -> MutexGuard<'_, Vec<Weak<KafkaReader>>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn writer(
        &self,
        config: ProducerTopicConfig,
    ) -> Result<Arc<dyn TopicWriter>, BrokerError> {
        self.ensure_open()?;

        let writer = self
            .writer_cache()
            .entry(config.topic.clone())
            .or_insert_with(|| {
                debug!(topic = %config.topic, "creating topic writer");
                Arc::new(KafkaWriter {
                    producer: self.producer.clone(),
                    topic: config.topic,
                })
            })
            .clone();
        Ok(writer)
    }

    async fn reader(
        &self,
        config: ConsumerTopicConfig,
    ) -> Result<Arc<dyn TopicReader>, BrokerError> {
        self.ensure_open()?;

        let mut client_config = self.common.clone();
        client_config
            .set("client.id", &config.client_id)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", config.offset_reset.as_str())
            .set(
                "session.timeout.ms",
                self.settings.session_timeout_ms.to_string(),
            );

        let tracker = Arc::new(OffsetTracker::new());
        let consumer: StreamConsumer<ReaderContext> =
            client_config.create_with_context(ReaderContext::new(tracker.clone()))?;
        consumer.subscribe(&[config.topic.as_str()])?;

        info!(
            topic = %config.topic,
            group_id = %config.group_id,
            "subscribed kafka consumer"
        );

        let reader = Arc::new(KafkaReader {
            consumer,
            tracker,
            closed: self.closed.child_token(),
        });
        let mut readers = self.reader_list();
        readers.retain(|r| r.strong_count() > 0);
        readers.push(Arc::downgrade(&reader));
        drop(readers);
        Ok(reader)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        let readers = std::mem::take(&mut *self.reader_list());
        for reader in readers.iter().filter_map(Weak::upgrade) {
            reader.consumer.unsubscribe();
        }
        self.writer_cache().clear();

        let producer = self.producer.clone();
        let timeout = self.settings.message_timeout();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout)).await;
        match flushed {
            Ok(Ok(())) => {
                info!("closed kafka broker client");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to flush producer on close");
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "producer flush task failed");
                Err(BrokerError::ProduceCanceled)
            }
        }
    }
}

pub struct KafkaWriter {
    producer: FutureProducer,
    topic: String,
}

#[async_trait]
impl TopicWriter for KafkaWriter {
    async fn write(&self, key: Option<&str>, payload: &[u8]) -> Result<(), BrokerError> {
        let mut record = FutureRecord::<str, [u8]>::to(&self.topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let delivery = match self.producer.send_result(record) {
            Ok(future) => future,
            Err((e, _)) => return Err(e.into()),
        };

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(e.into()),
            Err(_) => Err(BrokerError::ProduceCanceled),
        }
    }
}

pub struct KafkaReader {
    consumer: StreamConsumer<ReaderContext>,
    tracker: Arc<OffsetTracker>,
    closed: CancellationToken,
}

#[async_trait]
impl TopicReader for KafkaReader {
    async fn recv(&self) -> Result<Message, BrokerError> {
        let received = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(BrokerError::Closed),
            received = self.consumer.recv() => received?,
        };

        let headers = received
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_owned(),
                            header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let message = Message {
            topic: received.topic().to_owned(),
            partition: received.partition(),
            offset: received.offset(),
            key: received.key().map(<[u8]>::to_vec),
            payload: received.payload().map(<[u8]>::to_vec),
            headers,
        };
        self.tracker
            .track(&message.topic, message.partition, message.offset);
        Ok(message)
    }

    fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let Some(offset) = self
            .tracker
            .complete(&message.topic, message.partition, message.offset)
        else {
            return Ok(());
        };

        // The stored position is the next record to read
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(offset + 1),
        )?;
        self.consumer.store_offsets(&offsets)?;
        Ok(())
    }
}
