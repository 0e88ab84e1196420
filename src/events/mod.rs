//! Structured container events
//!
//! Containers emit [`ContainerEvent`]s through an injected
//! [`EventPublisher`]. Transport is external; the default publisher writes
//! structured log records, and tests use the channel-backed collector.

use crate::client::TopicPartition;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// What happened inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Consumer creation is about to begin
    ConsumerStarting,
    /// The consumer factory returned and the poll loop is running
    ConsumerStarted,
    /// Consumer creation failed; the container returned to stopped
    ConsumerFailedToStart { reason: String },
    /// No records received for the configured idle interval
    Idle { idle_for_ms: u64 },
    /// A single partition stayed silent for the configured interval
    IdlePartition {
        partition: TopicPartition,
        idle_for_ms: u64,
    },
    /// The poll loop has not returned from poll within the threshold
    NonResponsive { since_last_poll_ms: u64 },
    /// The poll loop is exiting
    ConsumerStopping,
    /// The consumer has been closed
    ConsumerStopped,
    /// The container and all of its resources have stopped
    ContainerStopped { cause: Option<String> },
    /// A container-wide pause took effect at the client
    Paused,
    /// A container-wide resume took effect at the client
    Resumed,
    /// A single partition was paused at the client
    PartitionPaused { partition: TopicPartition },
    /// A single partition was resumed at the client
    PartitionResumed { partition: TopicPartition },
    /// Partitions were revoked by the group coordinator
    RebalanceRevoked { partitions: Vec<TopicPartition> },
    /// Partitions were assigned by the group coordinator
    RebalanceAssigned { partitions: Vec<TopicPartition> },
    /// Partitions were lost without a clean revocation
    RebalanceLost { partitions: Vec<TopicPartition> },
    /// An offset commit failed
    CommitFailed { reason: String },
}

/// A structured event emitted by a container
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    /// Id of the emitting container
    pub container_id: String,

    /// Wall-clock emission time, milliseconds since epoch
    pub timestamp_ms: i64,

    /// What happened
    pub kind: EventKind,
}

impl ContainerEvent {
    /// Create an event stamped with the current wall clock
    pub fn now(container_id: impl Into<String>, kind: EventKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            container_id: container_id.into(),
            timestamp_ms,
            kind,
        }
    }
}

/// Sink for container events; must be safe for concurrent publication
/// from multiple containers
pub trait EventPublisher: Send + Sync {
    /// Publish one event
    fn publish(&self, event: ContainerEvent);
}

/// Default publisher: writes each event as a structured log record
#[derive(Debug, Default)]
pub struct LoggingEventPublisher;

impl EventPublisher for LoggingEventPublisher {
    fn publish(&self, event: ContainerEvent) {
        match &event.kind {
            EventKind::ConsumerFailedToStart { reason } => {
                warn!(container = %event.container_id, reason = %reason, "Consumer failed to start");
            }
            EventKind::NonResponsive { since_last_poll_ms } => {
                warn!(
                    container = %event.container_id,
                    since_last_poll_ms = %since_last_poll_ms,
                    "Consumer non-responsive"
                );
            }
            EventKind::CommitFailed { reason } => {
                warn!(container = %event.container_id, reason = %reason, "Offset commit failed");
            }
            kind => {
                info!(container = %event.container_id, event = ?kind, "Container event");
            }
        }
    }
}

/// Test publisher: collects events on an unbounded channel
#[derive(Clone)]
pub struct CollectingEventPublisher {
    tx: crossbeam_channel::Sender<ContainerEvent>,
    rx: crossbeam_channel::Receiver<ContainerEvent>,
}

impl CollectingEventPublisher {
    /// Create an empty collector
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Drain every event published so far
    pub fn drain(&self) -> Vec<ContainerEvent> {
        self.rx.try_iter().collect()
    }

    /// Wait for an event matching the predicate, up to `timeout`
    pub fn wait_for(
        &self,
        timeout: std::time::Duration,
        predicate: impl Fn(&ContainerEvent) -> bool,
    ) -> Option<ContainerEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            match self.rx.recv_timeout(remaining) {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Default for CollectingEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for CollectingEventPublisher {
    fn publish(&self, event: ContainerEvent) {
        let _ = self.tx.send(event);
    }
}

/// Publisher that forwards to several sinks in registration order
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    /// Compose publishers; events fan out in registration order
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

impl EventPublisher for CompositeEventPublisher {
    fn publish(&self, event: ContainerEvent) {
        for publisher in &self.publishers {
            publisher.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_collecting_publisher_drain() {
        let collector = CollectingEventPublisher::new();
        collector.publish(ContainerEvent::now("c-1", EventKind::ConsumerStarting));
        collector.publish(ContainerEvent::now("c-1", EventKind::ConsumerStarted));

        let events = collector.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::ConsumerStarting);
        assert_eq!(events[1].kind, EventKind::ConsumerStarted);
        assert!(collector.drain().is_empty());
    }

    #[test]
    fn test_wait_for_matching_event() {
        let collector = CollectingEventPublisher::new();
        collector.publish(ContainerEvent::now("c-1", EventKind::ConsumerStarting));
        collector.publish(ContainerEvent::now(
            "c-1",
            EventKind::Idle { idle_for_ms: 500 },
        ));

        let found = collector.wait_for(Duration::from_millis(50), |e| {
            matches!(e.kind, EventKind::Idle { .. })
        });
        assert!(found.is_some());

        let missing = collector.wait_for(Duration::from_millis(10), |e| {
            matches!(e.kind, EventKind::ContainerStopped { .. })
        });
        assert!(missing.is_none());
    }

    #[test]
    fn test_composite_fan_out() {
        let first = Arc::new(CollectingEventPublisher::new());
        let second = Arc::new(CollectingEventPublisher::new());
        let composite = CompositeEventPublisher::new(vec![first.clone(), second.clone()]);

        composite.publish(ContainerEvent::now("c-1", EventKind::Paused));
        assert_eq!(first.drain().len(), 1);
        assert_eq!(second.drain().len(), 1);
    }
}
