//! Retry-topic engine
//!
//! Failed records are rewritten into a chain of delayed retry topics and
//! finally a dead-letter topic: `main → main-retry-… → main-dlt`. Each hop
//! carries its history in headers; the consuming container pauses a
//! partition until the record's backoff deadline passes, so one slow record
//! never blocks sibling partitions.

pub mod headers;
pub mod publisher;
pub mod topology;

pub use publisher::DeadLetterPublisher;
pub use topology::{
    DestinationTopicResolver, RetryTopicConfiguration, RetryTopicConfigurationBuilder,
    SuffixStrategy,
};

use crate::handler::BinaryErrorClassifier;
use std::collections::HashSet;
use std::fmt;

/// Role of a destination in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    /// The user's own topic
    Main,
    /// A delayed retry topic for one attempt
    Retry,
    /// One retry topic reused for every attempt; the delay comes from the
    /// record's attempts header, not the topic identity
    ReusableRetry,
    /// Terminal dead-letter topic
    Dlt,
    /// Terminal no-op: the record is dropped with a log line
    NoOps,
}

/// What happens when a dead-letter publish itself fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DltStrategy {
    /// Propagate the publish failure
    FailOnError,
    /// Loop the record back to the last retry topic instead
    AlwaysRetryOnError,
    /// No dead-letter topic; the last retry is terminal
    NoDlt,
}

/// Static properties of one destination in a chain
#[derive(Debug, Clone)]
pub struct DestinationProperties {
    /// Redelivery delay for records entering this destination
    pub delay_ms: u64,

    /// Suffix appended to the main topic name
    pub suffix: String,

    /// Role in the chain
    pub kind: DestinationKind,

    /// Partitions for topic provisioning
    pub num_partitions: i32,

    /// Replication factor for topic provisioning
    pub replicas: i16,

    /// Dead-letter failure strategy for the whole chain
    pub dlt_strategy: DltStrategy,

    /// Chain-wide retry delivery budget
    pub max_retry_attempts: u32,

    /// Which error classes are retryable at all
    pub classifier: BinaryErrorClassifier,

    /// Total retry window from the original failure, when bounded
    pub timeout_ms: Option<u64>,

    /// Producer override for this destination, when routed through a
    /// dedicated producer
    pub producer_id: Option<String>,

    /// Error classes routed to this destination when it is a DLT; empty
    /// marks the generic DLT
    pub matching_error_classes: HashSet<String>,
}

/// A named destination: the topic plus its chain properties
#[derive(Debug, Clone)]
pub struct DestinationTopic {
    name: String,
    properties: DestinationProperties,
}

impl DestinationTopic {
    /// Pair a topic name with its properties
    pub fn new(name: impl Into<String>, properties: DestinationProperties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    /// The full topic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The suffix this destination appends to the main topic
    pub fn suffix(&self) -> &str {
        &self.properties.suffix
    }

    /// Role in the chain
    pub fn kind(&self) -> DestinationKind {
        self.properties.kind
    }

    /// Redelivery delay for this destination
    pub fn delay_ms(&self) -> u64 {
        self.properties.delay_ms
    }

    /// The chain's dead-letter strategy
    pub fn dlt_strategy(&self) -> DltStrategy {
        self.properties.dlt_strategy
    }

    /// Static properties
    pub fn properties(&self) -> &DestinationProperties {
        &self.properties
    }

    /// Whether this is the user's own topic
    pub fn is_main(&self) -> bool {
        self.properties.kind == DestinationKind::Main
    }

    /// Whether records entering this destination are delayed retries
    pub fn is_retry(&self) -> bool {
        matches!(
            self.properties.kind,
            DestinationKind::Retry | DestinationKind::ReusableRetry
        )
    }

    /// Whether this destination is reused for every attempt
    pub fn is_reusable(&self) -> bool {
        self.properties.kind == DestinationKind::ReusableRetry
    }

    /// Whether this is a dead-letter topic
    pub fn is_dlt(&self) -> bool {
        self.properties.kind == DestinationKind::Dlt
    }

    /// Whether records routed here are silently dropped
    pub fn is_no_ops(&self) -> bool {
        self.properties.kind == DestinationKind::NoOps
    }

    /// Whether a record with `attempts` total failed deliveries of the
    /// given error class gets another retry hop
    pub fn should_retry(&self, attempts: u32, error_class: &str) -> bool {
        attempts <= self.properties.max_retry_attempts
            && self.properties.classifier.classify(error_class)
    }

    /// Whether this DLT explicitly matches the error class
    pub fn matches_error(&self, error_class: &str) -> bool {
        self.properties.matching_error_classes.contains(error_class)
    }
}

impl fmt::Display for DestinationTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.name, self.properties.kind)
    }
}
