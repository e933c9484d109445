//! Offset Tracker - decides which offsets are safe to commit per partition
//!
//! Records of one partition are spread over several worker lanes and can
//! finish out of order. A committed position must never pass a record that is
//! still being processed, so the tracker only releases the highest offset
//! below the lowest one still in flight.

use std::collections::BTreeSet;

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TopicPartition {
    topic: String,
    partition: i32,
}

#[derive(Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    completed: BTreeSet<i64>,
}

#[derive(Default)]
pub struct OffsetTracker {
    partitions: DashMap<TopicPartition, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record that has been handed out and is not yet processed.
    pub fn track(&self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry(TopicPartition {
                topic: topic.to_owned(),
                partition,
            })
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Marks a record as processed.
    ///
    /// Returns the offset of the last record that may now be committed, or
    /// `None` when the committable position did not move.
    pub fn complete(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let key = TopicPartition {
            topic: topic.to_owned(),
            partition,
        };
        let mut state = self.partitions.get_mut(&key)?;

        if !state.in_flight.remove(&offset) {
            debug!(topic, partition, offset, "completed an untracked offset");
            return None;
        }
        state.completed.insert(offset);

        let watermark = match state.in_flight.first().copied() {
            Some(lowest_pending) => state.completed.range(..lowest_pending).next_back().copied(),
            None => state.completed.last().copied(),
        }?;

        state.completed = state.completed.split_off(&(watermark + 1));
        Some(watermark)
    }

    /// Drops all state for a partition, e.g. once it has been revoked from this member.
    pub fn forget(&self, topic: &str, partition: i32) {
        self.partitions.remove(&TopicPartition {
            topic: topic.to_owned(),
            partition,
        });
    }

    pub fn in_flight(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&TopicPartition {
                topic: topic.to_owned(),
                partition,
            })
            .map(|state| state.in_flight.len())
            .unwrap_or(0)
    }
}
