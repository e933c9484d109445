//! Consumption engine - fans one subscription out to a fixed set of worker lanes
//!
//! A single dispatcher pulls records from the broker and routes each one to a
//! lane chosen by its ordering key. Each lane handles its records one at a
//! time, so:
//! 1. Records sharing an ordering key are handled strictly in arrival order
//! 2. Records with different keys are handled concurrently
//! 3. Shutdown stops the dispatcher and lanes from taking new records, while
//!    handlers that already started run to completion

mod lane;
mod shutdown;

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, ConsumerTopicConfig, Message};
use crate::codec::Codec;
use crate::error::{ConnectorError, ConsumeError};
use crate::metrics_consts::MESSAGES_RECEIVED;

use lane::Lane;
pub use shutdown::ShutdownSource;

pub const DEFAULT_LANES: usize = 5;
pub const DEFAULT_LANE_BUFFER: usize = 16;

/// Invoked once per consumed record with its decoded value.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: CancellationToken, message: Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(CancellationToken, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, message: Value) -> anyhow::Result<()> {
        (self)(ctx, message).await
    }
}

/// What identifies an ordering domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingKey {
    /// Every record of a partition goes to the same lane.
    #[default]
    Partition,
    /// Records of a partition are split further by message key. Unkeyed records
    /// fall back to their partition.
    MessageKey,
}

/// Where a group with no committed position starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is not a valid offset reset, expected earliest or latest")]
pub struct ParseOffsetResetError(String);

impl FromStr for OffsetReset {
    type Err = ParseOffsetResetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            _ => Err(ParseOffsetResetError(s.to_owned())),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Exponential backoff between attempts of a failing handler.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Time to wait after the given number of failed retries (0 for the first retry).
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(10)),
        }
    }
}

/// What a lane does with a record whose handler (or decoding) failed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandlerErrorPolicy {
    /// Stop the whole session and return the error. The record is not acknowledged.
    #[default]
    Abort,
    /// Log the failure, acknowledge the record and move on.
    Skip,
    /// Re-run the handler up to `max_attempts` times in total, then abort.
    /// Decode failures abort straight away.
    Retry { max_attempts: u32, policy: RetryPolicy },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is not a valid handler error policy, expected abort, skip or retry")]
pub struct ParseHandlerErrorPolicyError(String);

impl FromStr for HandlerErrorPolicy {
    type Err = ParseHandlerErrorPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(HandlerErrorPolicy::Abort),
            "skip" => Ok(HandlerErrorPolicy::Skip),
            "retry" => Ok(HandlerErrorPolicy::Retry {
                max_attempts: 3,
                policy: RetryPolicy::default(),
            }),
            _ => Err(ParseHandlerErrorPolicyError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Number of concurrent worker lanes ("virtual partitions").
    pub lanes: usize,
    /// Records queued per lane before the dispatcher waits.
    pub lane_buffer: usize,
    pub ordering: OrderingKey,
    pub offset_reset: OffsetReset,
    pub error_policy: HandlerErrorPolicy,
    pub shutdown: ShutdownSource,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            lanes: DEFAULT_LANES,
            lane_buffer: DEFAULT_LANE_BUFFER,
            ordering: OrderingKey::default(),
            offset_reset: OffsetReset::default(),
            error_policy: HandlerErrorPolicy::default(),
            shutdown: ShutdownSource::default(),
        }
    }
}

impl ConsumerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn with_lane_buffer(mut self, lane_buffer: usize) -> Self {
        self.lane_buffer = lane_buffer;
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingKey) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.offset_reset = offset_reset;
        self
    }

    pub fn with_error_policy(mut self, error_policy: HandlerErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSource) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Lifecycle of one `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Subscribing,
    Running,
    Draining,
    Closed,
}

/// Keeps the first fatal error any lane or the dispatcher ran into.
#[derive(Default)]
pub(crate) struct FailureSlot(Mutex<Option<ConsumeError>>);

impl FailureSlot {
    pub(crate) fn record(&self, error: ConsumeError) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        } else {
            debug!(error = %error, "ignoring error after the first fatal one");
        }
    }

    fn is_set(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take(&self) -> Option<ConsumeError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// The lane a record belongs to. Stable for a given ordering key and lane count.
pub fn lane_for(message: &Message, ordering: OrderingKey, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    message.topic.hash(&mut hasher);
    message.partition.hash(&mut hasher);
    if ordering == OrderingKey::MessageKey {
        message.key.hash(&mut hasher);
    }
    (hasher.finish() % lanes.max(1) as u64) as usize
}

pub struct ConsumptionEngine {
    broker: Arc<dyn BrokerClient>,
    codec: Arc<dyn Codec>,
    options: ConsumerOptions,
    state: watch::Sender<SessionState>,
}

impl ConsumptionEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        codec: Arc<dyn Codec>,
        options: ConsumerOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            broker,
            codec,
            options,
            state,
        }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Follows the session through its states.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Consumes until shutdown, cancellation of `ctx`, or the first fatal error.
    ///
    /// Returns `Ok(())` for a graceful stop. Returns only once every lane has
    /// finished the record it was handling.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        config: ConsumerTopicConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConnectorError> {
        self.transition(SessionState::Subscribing);

        let reader = match self.broker.reader(config.clone()).await {
            Ok(reader) => reader,
            Err(error) => {
                error!(
                    topic = %config.topic,
                    group_id = %config.group_id,
                    error = %error,
                    "failed to subscribe"
                );
                self.transition(SessionState::Closed);
                return Err(ConsumeError::Subscribe {
                    topic: config.topic,
                    group_id: config.group_id,
                    error,
                }
                .into());
            }
        };

        // Fires on caller cancellation, the shutdown source, or a fatal error
        let stop = ctx.child_token();
        let _stop_on_exit = stop.clone().drop_guard();
        shutdown::bridge(&self.options.shutdown, &stop);

        let lane_count = self.options.lanes.max(1);
        let failure = Arc::new(FailureSlot::default());
        let mut lanes = JoinSet::new();
        let mut senders = Vec::with_capacity(lane_count);

        for id in 0..lane_count {
            let (sender, receiver) = mpsc::channel(self.options.lane_buffer.max(1));
            senders.push(sender);

            let lane = Lane {
                id,
                reader: reader.clone(),
                codec: self.codec.clone(),
                handler: handler.clone(),
                error_policy: self.options.error_policy.clone(),
                ctx: ctx.clone(),
                stop: stop.clone(),
                failure: failure.clone(),
            };
            lanes.spawn(lane.run(receiver));
        }

        info!(
            topic = %config.topic,
            group_id = %config.group_id,
            lanes = lane_count,
            "consumer session running"
        );
        self.transition(SessionState::Running);

        loop {
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = reader.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(error) => {
                    error!(topic = %config.topic, error = %error, "failed to read from broker");
                    failure.record(ConsumeError::Read {
                        topic: config.topic.clone(),
                        error,
                    });
                    stop.cancel();
                    break;
                }
            };

            metrics::counter!(MESSAGES_RECEIVED, "topic" => config.topic.clone()).increment(1);
            let lane = lane_for(&message, self.options.ordering, lane_count);
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                lane,
                "dispatching message"
            );

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                sent = senders[lane].send(message) => {
                    if sent.is_err() {
                        // The lane is gone, which only happens if it panicked
                        warn!(lane, "worker lane stopped unexpectedly");
                        stop.cancel();
                        break;
                    }
                }
            }
        }

        if !failure.is_set() {
            info!(topic = %config.topic, "shutdown requested, draining worker lanes");
            self.transition(SessionState::Draining);
        }

        // Closing the channels lets idle lanes exit
        drop(senders);
        while let Some(joined) = lanes.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker lane panicked");
                failure.record(ConsumeError::LanePanicked(e.to_string()));
            }
        }

        self.transition(SessionState::Closed);
        match failure.take() {
            Some(error) => Err(error.into()),
            None => {
                info!(
                    topic = %config.topic,
                    group_id = %config.group_id,
                    "consumer session closed"
                );
                Ok(())
            }
        }
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        debug!(from = ?previous, to = ?next, "consumer session state change");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::broker::{ProducerTopicConfig, TopicReader, TopicWriter};
    use crate::codec::JsonCodec;
    use crate::error::BrokerError;
    use crate::memory::MemoryBroker;

    const TOPIC: &str = "engine-test";

    fn topic_config() -> ConsumerTopicConfig {
        ConsumerTopicConfig {
            client_id: "engine-test".to_string(),
            group_id: "engine-group".to_string(),
            topic: TOPIC.to_string(),
            offset_reset: OffsetReset::Earliest,
        }
    }

    fn engine(broker: &Arc<MemoryBroker>, options: ConsumerOptions) -> ConsumptionEngine {
        ConsumptionEngine::new(broker.clone(), Arc::new(JsonCodec), options)
    }

    fn options(shutdown: &CancellationToken) -> ConsumerOptions {
        ConsumerOptions::new().with_shutdown(ShutdownSource::Token(shutdown.clone()))
    }

    fn message(partition: i32, key: Option<&str>) -> Message {
        Message {
            topic: TOPIC.to_string(),
            partition,
            offset: 0,
            key: key.map(|k| k.as_bytes().to_vec()),
            payload: None,
            headers: Vec::new(),
        }
    }

    /// Hands out one record, then waits forever. Every ack is refused.
    struct RejectingAckReader {
        delivered: AtomicBool,
    }

    #[async_trait]
    impl TopicReader for RejectingAckReader {
        async fn recv(&self) -> Result<Message, BrokerError> {
            if self.delivered.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(Message {
                payload: Some(json!({"seq": 0}).to_string().into_bytes()),
                ..message(0, None)
            })
        }

        fn ack(&self, _message: &Message) -> Result<(), BrokerError> {
            Err(BrokerError::Closed)
        }
    }

    struct RejectingAckClient(Arc<RejectingAckReader>);

    #[async_trait]
    impl BrokerClient for RejectingAckClient {
        async fn writer(
            &self,
            _config: ProducerTopicConfig,
        ) -> Result<Arc<dyn TopicWriter>, BrokerError> {
            Err(BrokerError::Closed)
        }

        async fn reader(
            &self,
            _config: ConsumerTopicConfig,
        ) -> Result<Arc<dyn TopicReader>, BrokerError> {
            let reader: Arc<dyn TopicReader> = self.0.clone();
            Ok(reader)
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition was not met in time");
    }

    #[test]
    fn test_lane_for_is_stable_per_partition() {
        for partition in 0..10 {
            let first = lane_for(&message(partition, Some("a")), OrderingKey::Partition, 5);
            let second = lane_for(&message(partition, Some("b")), OrderingKey::Partition, 5);
            assert_eq!(first, second);
            assert!(first < 5);
        }
    }

    #[test]
    fn test_lane_for_message_key_spreads_one_partition() {
        let lanes: std::collections::HashSet<_> = (0..50)
            .map(|i| {
                let key = format!("key-{i}");
                lane_for(&message(0, Some(&key)), OrderingKey::MessageKey, 5)
            })
            .collect();
        assert!(lanes.len() > 1);

        let a = lane_for(&message(0, Some("same")), OrderingKey::MessageKey, 5);
        let b = lane_for(&message(0, Some("same")), OrderingKey::MessageKey, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(100),
            Some(Duration::from_millis(500)),
        );
        assert_eq!(policy.time_until_next_retry(0), Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(1), Duration::from_millis(200));
        assert_eq!(policy.time_until_next_retry(2), Duration::from_millis(400));
        assert_eq!(policy.time_until_next_retry(3), Duration::from_millis(500));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Abort".parse(), Ok(HandlerErrorPolicy::Abort));
        assert_eq!("skip".parse(), Ok(HandlerErrorPolicy::Skip));
        assert!(matches!(
            "retry".parse::<HandlerErrorPolicy>(),
            Ok(HandlerErrorPolicy::Retry { max_attempts: 3, .. })
        ));
        assert!("explode".parse::<HandlerErrorPolicy>().is_err());
        assert_eq!("LATEST".parse(), Ok(OffsetReset::Latest));
        assert!("middle".parse::<OffsetReset>().is_err());
    }

    #[tokio::test]
    async fn test_per_partition_order_with_many_lanes() {
        let broker = Arc::new(MemoryBroker::new(3));
        for i in 0..100 {
            let partition = i % 3;
            let payload = json!({"partition": partition, "seq": i}).to_string();
            broker
                .append_raw(TOPIC, partition, None, payload.as_bytes())
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let seen: Arc<Mutex<HashMap<i64, Vec<i64>>>> = Arc::default();
        let handled = Arc::new(AtomicUsize::new(0));

        let handler = {
            let seen = seen.clone();
            let handled = handled.clone();
            move |_ctx: CancellationToken, value: Value| {
                let seen = seen.clone();
                let handled = handled.clone();
                async move {
                    let partition = value["partition"].as_i64().unwrap();
                    let seq = value["seq"].as_i64().unwrap();
                    // Uneven latency across keys must not reorder within a key
                    tokio::time::sleep(Duration::from_millis((seq % 4) as u64)).await;
                    seen.lock().unwrap().entry(partition).or_default().push(seq);
                    handled.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        };

        let engine = engine(&broker, options(&shutdown).with_lanes(5));
        assert_eq!(engine.options().lanes, 5);
        let ctx = CancellationToken::new();
        let run = engine.run(&ctx, topic_config(), Arc::new(handler));

        let (result, _) = tokio::join!(run, async {
            wait_until(|| handled.load(Ordering::SeqCst) == 100).await;
            shutdown.cancel();
        });

        result.unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 100);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for sequence in seen.values() {
            let mut sorted = sequence.clone();
            sorted.sort();
            assert_eq!(sequence, &sorted);
        }
        for partition in 0..3 {
            assert_eq!(
                broker.committed("engine-group", TOPIC, partition),
                Some(if partition == 0 { 34 } else { 33 })
            );
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_and_stops_dispatch() {
        let broker = Arc::new(MemoryBroker::new(1));
        for i in 0..10 {
            broker
                .append_raw(TOPIC, 0, None, json!({"seq": i}).to_string().as_bytes())
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(Notify::new());

        let handler = {
            let started = started.clone();
            let finished = finished.clone();
            let entered = entered.clone();
            move |_ctx: CancellationToken, _value: Value| {
                let started = started.clone();
                let finished = finished.clone();
                let entered = entered.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    entered.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        };

        let engine = engine(&broker, options(&shutdown).with_lanes(2));
        let mut state = engine.subscribe_state();
        let ctx = CancellationToken::new();

        let (result, started_at_signal) = tokio::join!(
            engine.run(&ctx, topic_config(), Arc::new(handler)),
            async {
                entered.notified().await;
                shutdown.cancel();
                started.load(Ordering::SeqCst)
            }
        );

        result.unwrap();
        assert_eq!(*state.borrow_and_update(), SessionState::Closed);
        // Nothing started after the signal, and everything that started finished
        assert_eq!(started.load(Ordering::SeqCst), started_at_signal);
        assert_eq!(finished.load(Ordering::SeqCst), started_at_signal);
        assert_eq!(
            broker.committed("engine-group", TOPIC, 0),
            Some(started_at_signal as i64)
        );
    }

    #[tokio::test]
    async fn test_caller_cancellation_is_graceful() {
        let broker = Arc::new(MemoryBroker::new(1));
        let shutdown = CancellationToken::new();
        let engine = engine(&broker, options(&shutdown));
        let ctx = CancellationToken::new();

        let handler = |_ctx: CancellationToken, _value: Value| async { anyhow::Ok(()) };
        let (result, _) = tokio::join!(engine.run(&ctx, topic_config(), Arc::new(handler)), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.cancel();
        });

        result.unwrap();
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_abort_policy_returns_handler_error() {
        let broker = Arc::new(MemoryBroker::new(1));
        for i in 0..5 {
            broker
                .append_raw(TOPIC, 0, None, json!({"seq": i}).to_string().as_bytes())
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handler = |_ctx: CancellationToken, value: Value| async move {
            if value["seq"] == 2 {
                anyhow::bail!("boom");
            }
            Ok(())
        };

        let engine = engine(&broker, options(&shutdown));
        let result = engine
            .run(&CancellationToken::new(), topic_config(), Arc::new(handler))
            .await;

        match result {
            Err(ConnectorError::Consume(ConsumeError::Handler { offset, error, .. })) => {
                assert_eq!(offset, 2);
                assert_eq!(error.to_string(), "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The failed record is never committed past
        assert_eq!(broker.committed("engine-group", TOPIC, 0), Some(2));
        assert_eq!(*engine.subscribe_state().borrow(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_skip_policy_continues_past_failures() {
        let broker = Arc::new(MemoryBroker::new(1));
        for i in 0..5 {
            broker
                .append_raw(TOPIC, 0, None, json!({"seq": i}).to_string().as_bytes())
                .unwrap();
        }
        broker.append_raw(TOPIC, 0, None, b"not json").unwrap();

        let shutdown = CancellationToken::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let handler = {
            let handled = handled.clone();
            move |_ctx: CancellationToken, value: Value| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    if value["seq"] == 1 {
                        anyhow::bail!("boom");
                    }
                    Ok(())
                }
            }
        };

        let engine = engine(
            &broker,
            options(&shutdown).with_error_policy(HandlerErrorPolicy::Skip),
        );
        let ctx = CancellationToken::new();
        let (result, _) = tokio::join!(engine.run(&ctx, topic_config(), Arc::new(handler)), async {
            wait_until(|| broker.committed("engine-group", TOPIC, 0) == Some(6)).await;
            shutdown.cancel();
        });

        result.unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_policy_retries_then_succeeds() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker
            .append_raw(TOPIC, 0, None, json!({"seq": 0}).to_string().as_bytes())
            .unwrap();

        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let handler = {
            let attempts = attempts.clone();
            move |_ctx: CancellationToken, _value: Value| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient");
                    }
                    Ok(())
                }
            }
        };

        let policy = HandlerErrorPolicy::Retry {
            max_attempts: 3,
            policy: RetryPolicy::new(2, Duration::from_millis(1), None),
        };
        let engine = engine(&broker, options(&shutdown).with_error_policy(policy));
        let ctx = CancellationToken::new();
        let (result, _) = tokio::join!(engine.run(&ctx, topic_config(), Arc::new(handler)), async {
            wait_until(|| broker.committed("engine-group", TOPIC, 0) == Some(1)).await;
            shutdown.cancel();
        });

        result.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_policy_gives_up() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker
            .append_raw(TOPIC, 0, None, json!({"seq": 0}).to_string().as_bytes())
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let handler = {
            let attempts = attempts.clone();
            move |_ctx: CancellationToken, _value: Value| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let result: anyhow::Result<()> = Err(anyhow::anyhow!("permanent"));
                    result
                }
            }
        };

        let policy = HandlerErrorPolicy::Retry {
            max_attempts: 2,
            policy: RetryPolicy::new(2, Duration::from_millis(1), None),
        };
        let shutdown = CancellationToken::new();
        let engine = engine(&broker, options(&shutdown).with_error_policy(policy));
        let result = engine
            .run(&CancellationToken::new(), topic_config(), Arc::new(handler))
            .await;

        assert!(matches!(
            result,
            Err(ConnectorError::Consume(ConsumeError::Handler { .. }))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decode_failure_aborts_by_default() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.append_raw(TOPIC, 0, None, b"{broken").unwrap();

        let shutdown = CancellationToken::new();
        let handler = |_ctx: CancellationToken, _value: Value| async { anyhow::Ok(()) };
        let engine = engine(&broker, options(&shutdown));
        let result = engine
            .run(&CancellationToken::new(), topic_config(), Arc::new(handler))
            .await;

        assert!(matches!(
            result,
            Err(ConnectorError::Consume(ConsumeError::Decode { offset: 0, .. }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retry_backoff() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker
            .append_raw(TOPIC, 0, None, json!({"seq": 0}).to_string().as_bytes())
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let handler = {
            let attempts = attempts.clone();
            move |_ctx: CancellationToken, _value: Value| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let result: anyhow::Result<()> = Err(anyhow::anyhow!("down"));
                    result
                }
            }
        };

        let policy = HandlerErrorPolicy::Retry {
            max_attempts: 10,
            policy: RetryPolicy::new(2, Duration::from_millis(200), None),
        };
        let shutdown = CancellationToken::new();
        let engine = engine(&broker, options(&shutdown).with_error_policy(policy));
        let ctx = CancellationToken::new();
        let (result, _) = tokio::join!(engine.run(&ctx, topic_config(), Arc::new(handler)), async {
            wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
            shutdown.cancel();
        });

        // Stopping mid-backoff is a graceful end, and the record stays unacked
        result.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(broker.committed("engine-group", TOPIC, 0), None);
    }

    #[tokio::test]
    async fn test_decode_failure_aborts_under_retry_policy() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.append_raw(TOPIC, 0, None, b"{broken").unwrap();

        let called = Arc::new(AtomicUsize::new(0));
        let handler = {
            let called = called.clone();
            move |_ctx: CancellationToken, _value: Value| {
                let called = called.clone();
                async move {
                    called.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        };

        let policy = HandlerErrorPolicy::Retry {
            max_attempts: 5,
            policy: RetryPolicy::new(2, Duration::from_millis(1), None),
        };
        let shutdown = CancellationToken::new();
        let engine = engine(&broker, options(&shutdown).with_error_policy(policy));
        let result = engine
            .run(&CancellationToken::new(), topic_config(), Arc::new(handler))
            .await;

        assert!(matches!(
            result,
            Err(ConnectorError::Consume(ConsumeError::Decode { offset: 0, .. }))
        ));
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(broker.committed("engine-group", TOPIC, 0), None);
    }

    #[tokio::test]
    async fn test_ack_failure_is_fatal() {
        let client = RejectingAckClient(Arc::new(RejectingAckReader {
            delivered: AtomicBool::new(false),
        }));
        let handled = Arc::new(AtomicUsize::new(0));
        let handler = {
            let handled = handled.clone();
            move |_ctx: CancellationToken, _value: Value| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        };

        let shutdown = CancellationToken::new();
        let engine = ConsumptionEngine::new(
            Arc::new(client),
            Arc::new(JsonCodec),
            options(&shutdown),
        );
        let result = engine
            .run(&CancellationToken::new(), topic_config(), Arc::new(handler))
            .await;

        match result {
            Err(ConnectorError::Consume(ConsumeError::Ack { offset, error, .. })) => {
                assert_eq!(offset, 0);
                assert!(matches!(error, BrokerError::Closed));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(*engine.subscribe_state().borrow(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_session() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.close().await.unwrap();

        let handler = |_ctx: CancellationToken, _value: Value| async { anyhow::Ok(()) };
        let engine = engine(&broker, ConsumerOptions::new());
        let result = engine
            .run(&CancellationToken::new(), topic_config(), Arc::new(handler))
            .await;

        assert!(matches!(
            result,
            Err(ConnectorError::Consume(ConsumeError::Subscribe { .. }))
        ));
        assert_eq!(*engine.subscribe_state().borrow(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_broker_close_is_fatal_read_error() {
        let broker = Arc::new(MemoryBroker::new(1));
        let shutdown = CancellationToken::new();
        let handler = |_ctx: CancellationToken, _value: Value| async { anyhow::Ok(()) };
        let engine = engine(&broker, options(&shutdown));
        let ctx = CancellationToken::new();

        let (result, _) = tokio::join!(
            engine.run(&ctx, topic_config(), Arc::new(handler)),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                broker.close().await.unwrap();
            }
        );

        assert!(matches!(
            result,
            Err(ConnectorError::Consume(ConsumeError::Read { .. }))
        ));
    }
}
