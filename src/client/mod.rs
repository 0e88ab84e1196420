//! Injected wire abstraction for Kafka consumers and producers
//!
//! Conveyor does not speak the Kafka protocol. Group membership, fetch I/O,
//! and wire framing live behind the [`Consumer`] and [`Producer`] traits,
//! implemented over a lower-level client library (or over the scripted mocks
//! in [`crate::testing`]). Every consumer method is invoked only from the
//! poll thread that owns it; [`ConsumerWaker`] is the one handle that may be
//! used from other threads.

pub mod record;

pub use record::{
    last_header, ConsumerRecord, Header, OffsetAndMetadata, OffsetMap, ProducerRecord,
    RecordBatch, RecordMetadata, TopicPartition,
};

use crate::error::{ConveyorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How a container selects the partitions it consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSelection {
    /// Subscribe to topics by name; the group coordinator assigns partitions
    Names(Vec<String>),

    /// Subscribe to every topic matching a pattern
    Pattern(String),

    /// Explicit partition assignment, bypassing group management
    Partitions(Vec<TopicPartition>),
}

impl TopicSelection {
    /// Topic names when statically known (names or explicit partitions)
    pub fn topic_names(&self) -> Vec<String> {
        match self {
            TopicSelection::Names(names) => names.clone(),
            TopicSelection::Pattern(_) => Vec::new(),
            TopicSelection::Partitions(partitions) => {
                let mut names = Vec::new();
                for tp in partitions {
                    if !names.contains(&tp.topic) {
                        names.push(tp.topic.clone());
                    }
                }
                names
            }
        }
    }
}

/// The broker-side offset reset policy the consumer was created with.
///
/// Drives the `LATEST_ONLY*` assignment-commit options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetResetPolicy {
    /// Start from the earliest available offset when no commit exists
    Earliest,
    /// Start from the log end when no commit exists
    Latest,
    /// Fail when no commit exists
    None,
}

/// Consumer group metadata snapshot, taken at the start of a transactional
/// batch and passed to `send_offsets_to_transaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupMetadata {
    /// Consumer group id
    pub group_id: String,

    /// Group generation at snapshot time
    pub generation_id: i32,

    /// Member id assigned by the coordinator
    pub member_id: String,

    /// Static group instance id, if configured
    pub group_instance_id: Option<String>,
}

impl ConsumerGroupMetadata {
    /// Metadata for a group with no generation yet
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            generation_id: -1,
            member_id: String::new(),
            group_instance_id: None,
        }
    }
}

/// Callbacks the consumer drives from inside `poll` when the group
/// coordinator redistributes partitions.
///
/// All methods run on the poll thread. The consumer reference is usable for
/// commits and position queries; implementations must not call `poll`
/// re-entrantly.
pub trait RebalanceHandler {
    /// Partitions were assigned to this consumer. An error here is fatal to
    /// the current generation; the container rejoins.
    fn on_partitions_assigned(
        &mut self,
        consumer: &dyn Consumer,
        partitions: &[TopicPartition],
    ) -> Result<()>;

    /// Partitions are being revoked cooperatively; invoked before the
    /// revocation completes so pending offsets can still be committed
    fn on_partitions_revoked(&mut self, consumer: &dyn Consumer, partitions: &[TopicPartition]);

    /// Partitions were lost without a clean revocation; offsets for them
    /// are already owned elsewhere and must not be committed
    fn on_partitions_lost(&mut self, consumer: &dyn Consumer, partitions: &[TopicPartition]);
}

/// Callback invoked with the outcome of an asynchronous commit
pub type CommitCallback = Arc<dyn Fn(&OffsetMap, Option<&ConveyorError>) + Send + Sync>;

/// Thread-safe handle that interrupts a blocking `poll`.
///
/// The only consumer operation callable from outside the poll thread.
pub trait ConsumerWaker: Send + Sync {
    /// Cause the current or next `poll` to return `ConveyorError::Wakeup`
    fn wakeup(&self);
}

/// A Kafka consumer as seen by the listener container.
///
/// Mirrors the semantics of the lower-level client: `poll` drives group
/// membership and invokes the rebalance handler from within; offsets are
/// "next offset to read"; `pause`/`resume` are client-side fetch gates that
/// do not affect group membership.
pub trait Consumer: Send {
    /// Subscribe to topics or a pattern; partitions arrive via rebalance
    fn subscribe(&self, selection: &TopicSelection) -> Result<()>;

    /// Take a fixed partition assignment, bypassing group management
    fn assign(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Fetch the next batch of records, blocking up to `timeout`.
    /// Rebalance callbacks fire on this thread before the poll returns.
    fn poll(&self, timeout: Duration, rebalance: &mut dyn RebalanceHandler)
        -> Result<RecordBatch>;

    /// Commit offsets synchronously, blocking up to `timeout`
    fn commit_sync(&self, offsets: &OffsetMap, timeout: Duration) -> Result<()>;

    /// Commit offsets asynchronously; the callback observes the outcome
    fn commit_async(&self, offsets: &OffsetMap, callback: CommitCallback) -> Result<()>;

    /// Move the fetch position for a partition
    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<()>;

    /// Move the fetch position to the earliest available offset
    fn seek_to_beginning(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Move the fetch position to the log end
    fn seek_to_end(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Earliest offset with a timestamp at or after the queried value,
    /// per partition; `None` when no such record exists
    fn offsets_for_times(
        &self,
        query: &HashMap<TopicPartition, i64>,
    ) -> Result<HashMap<TopicPartition, Option<i64>>>;

    /// Earliest available offsets
    fn beginning_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>>;

    /// Log-end offsets
    fn end_offsets(&self, partitions: &[TopicPartition])
        -> Result<HashMap<TopicPartition, i64>>;

    /// Stop fetching from the given partitions without leaving the group
    fn pause(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Resume fetching from previously paused partitions
    fn resume(&self, partitions: &[TopicPartition]) -> Result<()>;

    /// Partitions currently paused at the client
    fn paused(&self) -> Result<Vec<TopicPartition>>;

    /// Next offset that will be fetched for the partition
    fn position(&self, tp: &TopicPartition) -> Result<i64>;

    /// Last committed offsets; `None` entries mean no commit exists
    fn committed(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, Option<OffsetAndMetadata>>>;

    /// Partitions currently assigned to this consumer
    fn assignment(&self) -> Result<Vec<TopicPartition>>;

    /// The offset reset policy this consumer was created with
    fn reset_policy(&self) -> OffsetResetPolicy;

    /// Group metadata snapshot for transactional offset commits
    fn group_metadata(&self) -> ConsumerGroupMetadata;

    /// Handle for interrupting `poll` from another thread
    fn waker(&self) -> Arc<dyn ConsumerWaker>;

    /// Leave the group and release resources, blocking up to `timeout`
    fn close(&self, timeout: Duration) -> Result<()>;
}

/// Completion side of a pending send, held by the producer implementation
pub struct SendCompletion {
    tx: crossbeam_channel::Sender<Result<RecordMetadata>>,
}

impl SendCompletion {
    /// Deliver the send outcome
    pub fn complete(self, result: Result<RecordMetadata>) {
        let _ = self.tx.send(result);
    }
}

/// Handle to an in-flight send; resolves to the record metadata
pub struct SendFuture {
    rx: crossbeam_channel::Receiver<Result<RecordMetadata>>,
}

impl SendFuture {
    /// A future that is already resolved
    pub fn completed(result: Result<RecordMetadata>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    /// A pending future plus its completion handle
    pub fn pending() -> (SendCompletion, SendFuture) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (SendCompletion { tx }, SendFuture { rx })
    }

    /// Wait for the outcome, up to `timeout`
    pub fn get(self, timeout: Duration) -> Result<RecordMetadata> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(ConveyorError::Timeout(
                "send not acknowledged within timeout".to_string(),
            )),
        }
    }
}

/// A Kafka producer as seen by the transactional pipeline
pub trait Producer: Send + Sync {
    /// Begin a transaction; the producer must be transactional
    fn begin_transaction(&self) -> Result<()>;

    /// Publish a record; the returned future resolves on broker ack
    fn send(&self, record: ProducerRecord) -> Result<SendFuture>;

    /// Add consumer offsets to the current transaction, carrying the group
    /// metadata snapshot for group-aware fencing
    fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        group_metadata: &ConsumerGroupMetadata,
    ) -> Result<()>;

    /// Commit the current transaction
    fn commit_transaction(&self) -> Result<()>;

    /// Abort the current transaction
    fn abort_transaction(&self) -> Result<()>;

    /// Flush buffered sends
    fn flush(&self) -> Result<()>;

    /// Release the producer, blocking up to `timeout`
    fn close(&self, timeout: Duration);
}

/// Injected factory for consumers.
///
/// Called once per container start; a restarted container receives a fresh
/// consumer, never a reopened one.
pub trait ConsumerFactory: Send + Sync {
    /// Create a consumer for the group with the composed client id
    fn create(
        &self,
        group_id: &str,
        client_id_prefix: &str,
        client_id_suffix: &str,
        overrides: &HashMap<String, String>,
    ) -> Result<Box<dyn Consumer>>;
}

/// Injected factory for raw producers, wrapped by the pooled factory in
/// [`crate::producer`]
pub trait RawProducerFactory: Send + Sync {
    /// Create a producer; `transactional_id` is set for transactional use
    fn create_raw(&self, transactional_id: Option<&str>) -> Result<Box<dyn Producer>>;
}

/// Decodes record bytes into a typed payload. Payload conversion is an
/// external collaborator; the container never inspects record values.
pub trait MessageConverter: Send + Sync {
    /// The decoded payload type
    type Payload;

    /// Decode a record, or report the failure that the container will
    /// surface as a deserialization sentinel
    fn convert(&self, record: &ConsumerRecord) -> std::result::Result<Self::Payload, String>;
}
