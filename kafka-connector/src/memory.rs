//! In-process broker client, for tests and for running without a cluster.
//!
//! Topics are created on first use with a fixed number of partitions. Each
//! consumer group keeps its own committed position per partition, and every
//! reader of a group reads all partitions (there is no rebalancing).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::{
    BrokerClient, BrokerFactory, ConsumerTopicConfig, Message, ProducerTopicConfig, TopicReader,
    TopicWriter,
};
use crate::config::Config;
use crate::consumer::OffsetReset;
use crate::error::{BrokerError, ConnectError};
use crate::offsets::OffsetTracker;

pub const DEFAULT_PARTITIONS: i32 = 3;

struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    // Global append order, so readers interleave partitions the way records arrived
    sequence: u64,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<(String, String, i32), i64>,
    next_sequence: u64,
    round_robin: usize,
}

struct Shared {
    partitions: i32,
    state: Mutex<LogState>,
    appended: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn partitions_of<'a>(
        &self,
        state: &'a mut LogState,
        topic: &str,
    ) -> &'a mut Vec<Vec<StoredRecord>> {
        let partitions = self.partitions;
        state
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| (0..partitions).map(|_| Vec::new()).collect())
    }

    fn append(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<(i32, i64), BrokerError> {
        self.ensure_open()?;

        let mut state = self.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let partition = match (partition, key) {
            (Some(partition), _) => partition.rem_euclid(self.partitions),
            (None, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as i32
            }
            (None, None) => {
                let partition = (state.round_robin % self.partitions as usize) as i32;
                state.round_robin += 1;
                partition
            }
        };

        let log = &mut self.partitions_of(&mut state, topic)[partition as usize];
        log.push(StoredRecord {
            key: key.map(<[u8]>::to_vec),
            payload: payload.to_vec(),
            sequence,
        });
        let offset = log.len() as i64 - 1;
        drop(state);

        self.appended.notify_waiters();
        Ok((partition, offset))
    }
}

/// A broker client whose topics live in process memory.
pub struct MemoryBroker {
    shared: Arc<Shared>,
    writers: Mutex<HashMap<String, Arc<MemoryWriter>>>,
}

impl MemoryBroker {
    pub fn new(partitions: i32) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                state: Mutex::new(LogState::default()),
                appended: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a record to an explicit partition, bypassing any codec.
    pub fn append_raw(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<i64, BrokerError> {
        self.shared
            .append(topic, Some(partition), key, payload)
            .map(|(_, offset)| offset)
    }

    /// The next offset the group will read from a partition, once anything was committed.
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .lock()
            .committed
            .get(&(group_id.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    pub fn record_count(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn writer_cache(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryWriter>>> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn writer(
        &self,
        config: ProducerTopicConfig,
    ) -> Result<Arc<dyn TopicWriter>, BrokerError> {
        self.shared.ensure_open()?;

        let writer = self
            .writer_cache()
            .entry(config.topic.clone())
            .or_insert_with(|| {
                Arc::new(MemoryWriter {
                    shared: self.shared.clone(),
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
        self.shared.ensure_open()?;

        let mut state = self.shared.lock();
        let lengths: Vec<i64> = self
            .shared
            .partitions_of(&mut state, &config.topic)
            .iter()
            .map(|log| log.len() as i64)
            .collect();

        let cursors = lengths
            .iter()
            .enumerate()
            .map(|(partition, len)| {
                let key = (config.group_id.clone(), config.topic.clone(), partition as i32);
                match state.committed.get(&key) {
                    Some(offset) => *offset,
                    None => match config.offset_reset {
                        OffsetReset::Earliest => 0,
                        OffsetReset::Latest => *len,
                    },
                }
            })
            .collect();
        drop(state);

        Ok(Arc::new(MemoryReader {
            shared: self.shared.clone(),
            group_id: config.group_id,
            topic: config.topic,
            cursors: Mutex::new(cursors),
            tracker: OffsetTracker::new(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.writer_cache().clear();
            self.shared.appended.notify_waiters();
        }
        Ok(())
    }
}

pub struct MemoryWriter {
    shared: Arc<Shared>,
    topic: String,
}

#[async_trait]
impl TopicWriter for MemoryWriter {
    async fn write(&self, key: Option<&str>, payload: &[u8]) -> Result<(), BrokerError> {
        self.shared
            .append(&self.topic, None, key.map(str::as_bytes), payload)
            .map(|_| ())
    }
}

pub struct MemoryReader {
    shared: Arc<Shared>,
    group_id: String,
    topic: String,
    cursors: Mutex<Vec<i64>>,
    tracker: OffsetTracker,
}

impl MemoryReader {
    fn next_record(&self) -> Option<Message> {
        let state = self.shared.lock();
        let partitions = state.topics.get(&self.topic)?;
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);

        let (partition, record) = partitions
            .iter()
            .enumerate()
            .filter_map(|(partition, log)| {
                log.get(cursors[partition] as usize)
                    .map(|record| (partition, record))
            })
            .min_by_key(|(_, record)| record.sequence)?;

        let offset = cursors[partition];
        cursors[partition] += 1;
        self.tracker.track(&self.topic, partition as i32, offset);

        Some(Message {
            topic: self.topic.clone(),
            partition: partition as i32,
            offset,
            key: record.key.clone(),
            payload: Some(record.payload.clone()),
            headers: Vec::new(),
        })
    }
}

#[async_trait]
impl TopicReader for MemoryReader {
    async fn recv(&self) -> Result<Message, BrokerError> {
        loop {
            // Registered before checking, so an append in between is not missed
            let appended = self.shared.appended.notified();
            self.shared.ensure_open()?;

            if let Some(message) = self.next_record() {
                return Ok(message);
            }
            appended.await;
        }
    }

    fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;

        if let Some(offset) = self
            .tracker
            .complete(&message.topic, message.partition, message.offset)
        {
            self.shared.lock().committed.insert(
                (self.group_id.clone(), self.topic.clone(), message.partition),
                offset + 1,
            );
        }
        Ok(())
    }
}

/// Hands out `MemoryBroker`s and remembers every one it created.
pub struct MemoryBrokerFactory {
    partitions: i32,
    connections: AtomicUsize,
    failures: AtomicUsize,
    brokers: Mutex<Vec<Arc<MemoryBroker>>>,
}

impl Default for MemoryBrokerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBrokerFactory {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            partitions,
            connections: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            brokers: Mutex::new(Vec::new()),
        }
    }

    /// Number of `connect` calls so far, failed ones included.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connections(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn brokers(&self) -> Vec<Arc<MemoryBroker>> {
        self.brokers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BrokerFactory for MemoryBrokerFactory {
    fn connect(&self, config: &Config) -> Result<Arc<dyn BrokerClient>, ConnectError> {
        self.connections.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ConnectError::InvalidConfig(format!(
                "injected connection failure for {}",
                config.bootstrap_servers_list()
            )));
        }

        let broker = Arc::new(MemoryBroker::new(self.partitions));
        self.brokers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(broker.clone());
        Ok(broker)
    }
}
