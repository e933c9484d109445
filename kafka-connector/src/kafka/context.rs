use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::offsets::OffsetTracker;

/// Consumer callbacks for one reader. Drops in-flight bookkeeping for
/// partitions this member no longer owns, so late acks cannot store offsets for them.
pub struct ReaderContext {
    tracker: Arc<OffsetTracker>,
}

impl ReaderContext {
    pub fn new(tracker: Arc<OffsetTracker>) -> Self {
        Self { tracker }
    }

    fn forget_revoked(&self, partitions: &TopicPartitionList) {
        for elem in partitions.elements() {
            self.tracker.forget(elem.topic(), elem.partition());
        }
    }
}

impl ClientContext for ReaderContext {}

impl ConsumerContext for ReaderContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("skipping empty revoke rebalance");
                    return;
                }

                info!(partitions = partitions.count(), "partitions revoked");
                self.forget_revoked(partitions);
            }
            Rebalance::Assign(partitions) => {
                debug!(partitions = partitions.count(), "pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!(partitions = partitions.count(), "partitions assigned");
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(partitions = offsets.count(), "committed offsets"),
            Err(e) => warn!(error = %e, "failed to commit offsets"),
        }
    }
}
