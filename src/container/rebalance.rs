//! User-facing rebalance hooks
//!
//! The container wraps the user listener and guarantees the ordering
//! documented on each method: the before-commit hook runs first, then the
//! container commits pending offsets for the revoked partitions, then the
//! after-commit hook runs. Lost partitions never commit and never route
//! through the revoke path.

use crate::client::{Consumer, TopicPartition};

/// Rebalance callbacks with access to the consumer. All methods run on the
/// poll thread and default to no-ops; implement only what you need.
pub trait ContainerRebalanceListener: Send {
    /// Partitions are being revoked; invoked before the container commits
    /// any pending offsets for them
    fn on_partitions_revoked_before_commit(
        &mut self,
        consumer: &dyn Consumer,
        partitions: &[TopicPartition],
    ) {
        let _ = (consumer, partitions);
    }

    /// Invoked once the commit for the revoked partitions finished
    /// (successfully or not; a failure surfaces as a commit-failed event)
    fn on_partitions_revoked_after_commit(
        &mut self,
        consumer: &dyn Consumer,
        partitions: &[TopicPartition],
    ) {
        let _ = (consumer, partitions);
    }

    /// Partitions were assigned to this consumer
    fn on_partitions_assigned(
        &mut self,
        consumer: &dyn Consumer,
        partitions: &[TopicPartition],
    ) {
        let _ = (consumer, partitions);
    }

    /// Partitions were lost without a clean revocation. Their offsets are
    /// already owned elsewhere; implementations must not commit here, and
    /// the container never invokes the revoke hooks for lost partitions.
    fn on_partitions_lost(&mut self, consumer: &dyn Consumer, partitions: &[TopicPartition]) {
        let _ = (consumer, partitions);
    }
}

/// The default listener: every hook is a no-op
#[derive(Debug, Default)]
pub struct NoopRebalanceListener;

impl ContainerRebalanceListener for NoopRebalanceListener {}
