//! Container configuration
//!
//! [`ContainerProperties`] is a configuration snapshot frozen when a
//! container starts. Mutating a properties value after start has no effect
//! on a running container; `stop()` + `start()` picks up the new snapshot.

use crate::client::{CommitCallback, TopicPartition, TopicSelection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Policy mapping listener completion to offset commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// Commit after each record
    Record,
    /// Commit at the end of each poll batch
    Batch,
    /// Commit when `ack_time` has elapsed since the last commit
    Time,
    /// Commit when `ack_count` records have been processed
    Count,
    /// Commit when either the count or the time threshold trips
    CountTime,
    /// Commit only what the acknowledgment handle acked, at the next poll
    /// boundary
    Manual,
    /// Commit from the acknowledgment handle directly on the poll thread
    ManualImmediate,
}

impl AckMode {
    /// Whether offsets move to the commit ledger only via an
    /// acknowledgment handle
    pub fn is_manual(&self) -> bool {
        matches!(self, AckMode::Manual | AckMode::ManualImmediate)
    }
}

/// Whether an initial offset is committed on first assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentCommitOption {
    /// Never commit on assignment
    Never,
    /// Always commit the current position on first assignment when no
    /// committed offset exists
    Always,
    /// Commit only when the reset policy is `latest` and no committed
    /// offset exists; may run inside a throwaway transaction
    LatestOnly,
    /// Like `LatestOnly` but never opens a transaction for the commit
    LatestOnlyNoTx,
}

impl AssignmentCommitOption {
    /// Whether this option can produce an initial commit at all
    pub fn may_commit(&self) -> bool {
        !matches!(self, AssignmentCommitOption::Never)
    }

    /// Whether the commit applies only under a `latest` reset policy
    pub fn latest_only(&self) -> bool {
        matches!(
            self,
            AssignmentCommitOption::LatestOnly | AssignmentCommitOption::LatestOnlyNoTx
        )
    }
}

/// Configuration snapshot for a listener container, frozen at start
#[derive(Clone)]
pub struct ContainerProperties {
    /// Topics, pattern, or explicit partitions to consume
    pub selection: TopicSelection,

    /// Consumer group id
    pub group_id: String,

    /// Prefix for composed client ids
    pub client_id_prefix: String,

    /// Static group membership id, if any
    pub group_instance_id: Option<String>,

    /// Offset commit policy
    pub ack_mode: AckMode,

    /// Record threshold for `Count`/`CountTime`
    pub ack_count: u32,

    /// Time threshold for `Time`/`CountTime`
    pub ack_time: Duration,

    /// Max block time for each poll
    pub poll_timeout: Duration,

    /// Poll timeout used while the whole container is paused
    pub poll_timeout_while_paused: Duration,

    /// How long `stop` waits for the poll loop to exit
    pub shutdown_timeout: Duration,

    /// Synchronous commits when true, asynchronous otherwise
    pub sync_commits: bool,

    /// Timeout for synchronous commits
    pub sync_commit_timeout: Duration,

    /// Bounded retry budget for failed synchronous commits
    pub commit_retries: u32,

    /// Emit an idle event when no records arrive for this long
    pub idle_event_interval: Option<Duration>,

    /// Emit a per-partition idle event when a partition stays silent
    pub idle_partition_event_interval: Option<Duration>,

    /// Multiplier applied to the idle interval before the first record
    pub idle_before_data_multiplier: f64,

    /// How often the monitor thread checks poll liveness
    pub monitor_interval: Duration,

    /// Poll-timeout multiplier before a consumer counts as non-responsive
    pub no_poll_threshold: f64,

    /// Sleep-and-retry interval for authentication/authorization failures;
    /// `None` stops the container instead
    pub auth_retry_interval: Option<Duration>,

    /// Initial-offset commit policy on first assignment
    pub assignment_commit_option: AssignmentCommitOption,

    /// Pause between records of the current batch instead of at the next
    /// poll boundary
    pub pause_immediate: bool,

    /// Drop un-dispatched records from the current poll on stop
    pub stop_immediate: bool,

    /// Split transactional batch dispatch into per-partition sub-batches
    pub sub_batch_per_partition: bool,

    /// Allow out-of-order acknowledgments with gap tracking
    pub async_acks: bool,

    /// Stop the container when a transactional producer is fenced
    pub stop_container_when_fenced: bool,

    /// Run record interceptors before `begin_transaction` when true
    pub intercept_before_tx: bool,

    /// Observer for asynchronous commit outcomes
    pub commit_callback: Option<CommitCallback>,

    /// Extra consumer properties passed to the consumer factory
    pub consumer_overrides: HashMap<String, String>,
}

impl ContainerProperties {
    /// Default poll timeout
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default poll timeout while paused
    pub const DEFAULT_POLL_TIMEOUT_WHILE_PAUSED: Duration = Duration::from_millis(100);

    /// Default shutdown timeout
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default synchronous commit timeout
    pub const DEFAULT_SYNC_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default monitor interval
    pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

    /// Default no-poll threshold multiplier
    pub const DEFAULT_NO_POLL_THRESHOLD: f64 = 3.0;

    /// Default idle-before-data multiplier
    pub const DEFAULT_IDLE_BEFORE_DATA_MULTIPLIER: f64 = 5.0;

    /// Default bounded commit retry budget
    pub const DEFAULT_COMMIT_RETRIES: u32 = 3;

    /// Start building properties for a subscription
    pub fn builder(
        selection: TopicSelection,
        group_id: impl Into<String>,
    ) -> ContainerPropertiesBuilder {
        ContainerPropertiesBuilder::new(selection, group_id)
    }

    /// Properties consuming the named topics with defaults
    pub fn for_topics(topics: &[&str], group_id: impl Into<String>) -> Self {
        Self::builder(
            TopicSelection::Names(topics.iter().map(|t| t.to_string()).collect()),
            group_id,
        )
        .build()
    }

    /// Explicitly assigned partitions, when configured
    pub fn explicit_partitions(&self) -> Option<&[TopicPartition]> {
        match &self.selection {
            TopicSelection::Partitions(partitions) => Some(partitions),
            _ => None,
        }
    }
}

/// Builder for [`ContainerProperties`]
#[derive(Clone)]
pub struct ContainerPropertiesBuilder {
    properties: ContainerProperties,
}

impl ContainerPropertiesBuilder {
    /// Create a builder with defaults
    pub fn new(selection: TopicSelection, group_id: impl Into<String>) -> Self {
        Self {
            properties: ContainerProperties {
                selection,
                group_id: group_id.into(),
                client_id_prefix: "conveyor".to_string(),
                group_instance_id: None,
                ack_mode: AckMode::Batch,
                ack_count: 1,
                ack_time: Duration::from_secs(5),
                poll_timeout: ContainerProperties::DEFAULT_POLL_TIMEOUT,
                poll_timeout_while_paused:
                    ContainerProperties::DEFAULT_POLL_TIMEOUT_WHILE_PAUSED,
                shutdown_timeout: ContainerProperties::DEFAULT_SHUTDOWN_TIMEOUT,
                sync_commits: true,
                sync_commit_timeout: ContainerProperties::DEFAULT_SYNC_COMMIT_TIMEOUT,
                commit_retries: ContainerProperties::DEFAULT_COMMIT_RETRIES,
                idle_event_interval: None,
                idle_partition_event_interval: None,
                idle_before_data_multiplier:
                    ContainerProperties::DEFAULT_IDLE_BEFORE_DATA_MULTIPLIER,
                monitor_interval: ContainerProperties::DEFAULT_MONITOR_INTERVAL,
                no_poll_threshold: ContainerProperties::DEFAULT_NO_POLL_THRESHOLD,
                auth_retry_interval: None,
                assignment_commit_option: AssignmentCommitOption::LatestOnlyNoTx,
                pause_immediate: false,
                stop_immediate: false,
                sub_batch_per_partition: false,
                async_acks: false,
                stop_container_when_fenced: false,
                intercept_before_tx: true,
                commit_callback: None,
                consumer_overrides: HashMap::new(),
            },
        }
    }

    /// Set the offset commit policy
    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.properties.ack_mode = ack_mode;
        self
    }

    /// Set the record threshold for `Count`/`CountTime`
    pub fn ack_count(mut self, count: u32) -> Self {
        self.properties.ack_count = count;
        self
    }

    /// Set the time threshold for `Time`/`CountTime`
    pub fn ack_time(mut self, time: Duration) -> Self {
        self.properties.ack_time = time;
        self
    }

    /// Set the poll timeout
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.properties.poll_timeout = timeout;
        self
    }

    /// Set the shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.properties.shutdown_timeout = timeout;
        self
    }

    /// Set the client id prefix
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.properties.client_id_prefix = prefix.into();
        self
    }

    /// Set the static group instance id
    pub fn group_instance_id(mut self, id: impl Into<String>) -> Self {
        self.properties.group_instance_id = Some(id.into());
        self
    }

    /// Use synchronous or asynchronous commits
    pub fn sync_commits(mut self, sync: bool) -> Self {
        self.properties.sync_commits = sync;
        self
    }

    /// Set the synchronous commit timeout
    pub fn sync_commit_timeout(mut self, timeout: Duration) -> Self {
        self.properties.sync_commit_timeout = timeout;
        self
    }

    /// Set the bounded commit retry budget
    pub fn commit_retries(mut self, retries: u32) -> Self {
        self.properties.commit_retries = retries;
        self
    }

    /// Emit idle events at this interval
    pub fn idle_event_interval(mut self, interval: Duration) -> Self {
        self.properties.idle_event_interval = Some(interval);
        self
    }

    /// Emit per-partition idle events at this interval
    pub fn idle_partition_event_interval(mut self, interval: Duration) -> Self {
        self.properties.idle_partition_event_interval = Some(interval);
        self
    }

    /// Set the monitor interval
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.properties.monitor_interval = interval;
        self
    }

    /// Set the no-poll threshold multiplier
    pub fn no_poll_threshold(mut self, threshold: f64) -> Self {
        self.properties.no_poll_threshold = threshold;
        self
    }

    /// Retry authentication/authorization failures at this interval
    pub fn auth_retry_interval(mut self, interval: Duration) -> Self {
        self.properties.auth_retry_interval = Some(interval);
        self
    }

    /// Set the initial-offset commit policy
    pub fn assignment_commit_option(mut self, option: AssignmentCommitOption) -> Self {
        self.properties.assignment_commit_option = option;
        self
    }

    /// Pause between records instead of at the next poll boundary
    pub fn pause_immediate(mut self, immediate: bool) -> Self {
        self.properties.pause_immediate = immediate;
        self
    }

    /// Drop un-dispatched records on stop
    pub fn stop_immediate(mut self, immediate: bool) -> Self {
        self.properties.stop_immediate = immediate;
        self
    }

    /// Split transactional batches into per-partition sub-batches
    pub fn sub_batch_per_partition(mut self, enabled: bool) -> Self {
        self.properties.sub_batch_per_partition = enabled;
        self
    }

    /// Allow out-of-order acknowledgments with gap tracking
    pub fn async_acks(mut self, enabled: bool) -> Self {
        self.properties.async_acks = enabled;
        self
    }

    /// Stop the container when a transactional producer is fenced
    pub fn stop_container_when_fenced(mut self, stop: bool) -> Self {
        self.properties.stop_container_when_fenced = stop;
        self
    }

    /// Run record interceptors before `begin_transaction`
    pub fn intercept_before_tx(mut self, before: bool) -> Self {
        self.properties.intercept_before_tx = before;
        self
    }

    /// Observe asynchronous commit outcomes
    pub fn commit_callback(mut self, callback: CommitCallback) -> Self {
        self.properties.commit_callback = Some(callback);
        self
    }

    /// Add a consumer property override
    pub fn consumer_override(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.properties
            .consumer_overrides
            .insert(key.into(), value.into());
        self
    }

    /// Freeze the snapshot
    pub fn build(self) -> ContainerProperties {
        self.properties
    }
}

/// A fully-formed listener endpoint handed to the registry by the external
/// registrar. The core never discovers endpoints itself.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    /// Container id, unique within a registry
    pub id: String,

    /// Consumer group id
    pub group_id: String,

    /// Topics, pattern, or explicit partitions
    pub selection: TopicSelection,

    /// Requested number of single-threaded children
    pub concurrency: usize,

    /// Client id prefix override; the container id is used when absent
    pub client_id_prefix: Option<String>,
}

impl EndpointDescriptor {
    /// Create a descriptor with concurrency 1
    pub fn new(
        id: impl Into<String>,
        group_id: impl Into<String>,
        selection: TopicSelection,
    ) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            selection,
            concurrency: 1,
            client_id_prefix: None,
        }
    }

    /// Set the requested concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the client id prefix
    pub fn with_client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = Some(prefix.into());
        self
    }
}
