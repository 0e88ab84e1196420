//! Error-handler pipeline
//!
//! When a listener throws, the container hands the failure to an
//! [`ErrorHandler`]. The default implementation classifies the error,
//! tracks per-record delivery attempts, and decides between seek-back
//! retry, in-memory retention, recovery (dead-letter or log-only), and
//! stopping the container.

pub mod after_rollback;

pub use after_rollback::{AfterRollbackProcessor, DefaultAfterRollbackProcessor};

use crate::client::{Consumer, ConsumerRecord};
use crate::container::ContainerHandle;
use crate::error::{ListenerError, Result, DESERIALIZATION_ERROR_CLASS};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Two-way verdict over error classes: retryable or not
#[derive(Debug, Clone)]
pub struct BinaryErrorClassifier {
    classes: HashSet<String>,
    matched_value: bool,
    default_value: bool,
}

impl BinaryErrorClassifier {
    /// Allow-list: only the given classes are retryable
    pub fn retry_on<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
            matched_value: true,
            default_value: false,
        }
    }

    /// Deny-list: everything except the given classes is retryable
    pub fn no_retry_on<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
            matched_value: false,
            default_value: true,
        }
    }

    /// Everything is retryable
    pub fn retry_all() -> Self {
        Self {
            classes: HashSet::new(),
            matched_value: false,
            default_value: true,
        }
    }

    /// Whether an error of the given class should be retried
    pub fn classify(&self, class: &str) -> bool {
        if self.classes.contains(class) {
            self.matched_value
        } else {
            self.default_value
        }
    }
}

impl Default for BinaryErrorClassifier {
    /// Deny-list of classes that never benefit from redelivery
    fn default() -> Self {
        Self::no_retry_on([DESERIALIZATION_ERROR_CLASS, "ConversionError"])
    }
}

/// Backoff applied between delivery attempts of the same record
#[derive(Debug, Clone, PartialEq)]
pub enum BackOffPolicy {
    /// Retry immediately
    None,
    /// The same delay for every attempt
    Fixed {
        /// Delay between attempts
        delay: Duration,
    },
    /// Geometrically growing delay, capped
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Growth factor per attempt
        multiplier: f64,
        /// Upper bound for any single delay
        max: Duration,
    },
}

impl BackOffPolicy {
    /// Delay before retry number `retry` (zero-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            BackOffPolicy::None => Duration::ZERO,
            BackOffPolicy::Fixed { delay } => *delay,
            BackOffPolicy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let millis = initial.as_millis() as f64 * multiplier.powi(retry as i32);
                Duration::from_millis((millis as u64).min(max.as_millis() as u64))
            }
        }
    }

    /// The delays for `retries` consecutive retries, in milliseconds
    pub fn intervals(&self, retries: u32) -> Vec<u64> {
        (0..retries)
            .map(|retry| self.delay_for(retry).as_millis() as u64)
            .collect()
    }

    /// Whether every retry uses the same delay
    pub fn is_constant(&self) -> bool {
        !matches!(self, BackOffPolicy::Exponential { .. })
    }
}

/// Per-record delivery attempt counts, keyed by coordinates
#[derive(Debug, Default)]
pub struct FailedRecordTracker {
    attempts: HashMap<(String, i32, i64), u32>,
}

impl FailedRecordTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed delivery; returns the total failures so far
    pub fn record_failure(&mut self, record: &ConsumerRecord) -> u32 {
        let key = (record.topic.clone(), record.partition, record.offset);
        let attempts = self.attempts.entry(key).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// Current failure count without recording a new one
    pub fn failures(&self, record: &ConsumerRecord) -> u32 {
        self.attempts
            .get(&(record.topic.clone(), record.partition, record.offset))
            .copied()
            .unwrap_or(0)
    }

    /// Forget a record after success or recovery
    pub fn clear(&mut self, record: &ConsumerRecord) {
        self.attempts
            .remove(&(record.topic.clone(), record.partition, record.offset));
    }

    /// Forget everything
    pub fn clear_all(&mut self) {
        self.attempts.clear();
    }
}

/// What the container should do with a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Failure consumed (skipped or recovered in place); commit and proceed
    Handled,
    /// Seek back to the failing offsets and abandon the rest of the batch
    SeekAndRetry,
    /// Keep the unprocessed records in memory and pause their partitions
    Retain,
    /// Record published to the retry/dead-letter topology; proceed
    DeadLettered,
    /// Unrecoverable; stop the container
    Fatal,
}

/// Terminal consumer for a record whose retries are exhausted
pub trait RecordRecoverer: Send + Sync {
    /// Consume the failed record (publish to a dead-letter destination,
    /// log, or drop)
    fn recover(&self, record: &ConsumerRecord, error: &ListenerError, attempts: u32)
        -> Result<()>;

    /// Whether recovery publishes to the retry topology
    fn is_dead_letter(&self) -> bool {
        false
    }
}

/// Recoverer that only logs the dropped record
#[derive(Debug, Default)]
pub struct LoggingRecoverer;

impl RecordRecoverer for LoggingRecoverer {
    fn recover(
        &self,
        record: &ConsumerRecord,
        error: &ListenerError,
        attempts: u32,
    ) -> Result<()> {
        warn!(
            topic = %record.topic,
            partition = %record.partition,
            offset = %record.offset,
            attempts = %attempts,
            error = %error,
            "Retries exhausted, dropping record"
        );
        Ok(())
    }
}

/// Strategy invoked for every listener failure
pub trait ErrorHandler: Send {
    /// Decide what to do with a failed record dispatch. `remaining` holds
    /// the not-yet-dispatched records of the poll batch, failed record
    /// excluded.
    fn handle_record_failure(
        &mut self,
        error: &ListenerError,
        failed: &ConsumerRecord,
        remaining: &[ConsumerRecord],
        consumer: &dyn Consumer,
        container: &ContainerHandle,
    ) -> Decision;

    /// Decide what to do with a failed batch dispatch
    fn handle_batch_failure(
        &mut self,
        error: &ListenerError,
        records: &[ConsumerRecord],
        consumer: &dyn Consumer,
        container: &ContainerHandle,
    ) -> Decision;

    /// Whether retries use consumer seeks (true) or in-memory retention
    /// of the unprocessed records (false)
    fn seeks_after_handling(&self) -> bool {
        true
    }

    /// Backoff before the next delivery of a record that just failed
    fn retry_delay_for(&self, record: &ConsumerRecord) -> Duration {
        let _ = record;
        Duration::ZERO
    }

    /// A record was dispatched successfully; forget its failure history
    fn record_succeeded(&mut self, record: &ConsumerRecord);
}

/// Default handler: classify, retry within a budget, then recover
pub struct DefaultErrorHandler {
    classifier: BinaryErrorClassifier,
    backoff: BackOffPolicy,
    max_attempts: u32,
    tracker: FailedRecordTracker,
    recoverer: Option<Arc<dyn RecordRecoverer>>,
    seeks_after_handling: bool,
}

impl DefaultErrorHandler {
    /// Default delivery attempts per record (first delivery plus retries)
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

    /// Handler with the default classifier, no backoff, and log-only
    /// recovery
    pub fn new() -> Self {
        Self {
            classifier: BinaryErrorClassifier::default(),
            backoff: BackOffPolicy::None,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            tracker: FailedRecordTracker::new(),
            recoverer: None,
            seeks_after_handling: true,
        }
    }

    /// Replace the classifier
    pub fn with_classifier(mut self, classifier: BinaryErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Set the backoff between delivery attempts
    pub fn with_backoff(mut self, backoff: BackOffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the delivery-attempt budget (including the first delivery)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the terminal recoverer
    pub fn with_recoverer(mut self, recoverer: Arc<dyn RecordRecoverer>) -> Self {
        self.recoverer = Some(recoverer);
        self
    }

    /// Retain unprocessed records in memory instead of seeking back
    pub fn with_seeks_after_handling(mut self, seeks: bool) -> Self {
        self.seeks_after_handling = seeks;
        self
    }

    fn recover(&mut self, record: &ConsumerRecord, error: &ListenerError) -> Decision {
        let attempts = self.tracker.failures(record).max(1);
        let outcome = match &self.recoverer {
            Some(recoverer) => recoverer
                .recover(record, error, attempts)
                .map(|()| recoverer.is_dead_letter()),
            None => LoggingRecoverer.recover(record, error, attempts).map(|()| false),
        };
        match outcome {
            Ok(dead_lettered) => {
                self.tracker.clear(record);
                if dead_lettered {
                    Decision::DeadLettered
                } else {
                    Decision::Handled
                }
            }
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = %record.partition,
                    offset = %record.offset,
                    error = %e,
                    "Recovery failed, record will be retried"
                );
                if self.seeks_after_handling {
                    Decision::SeekAndRetry
                } else {
                    Decision::Retain
                }
            }
        }
    }

    fn decide(&mut self, error: &ListenerError, failed: &ConsumerRecord) -> Decision {
        if !self.classifier.classify(error.class()) {
            debug!(
                class = %error.class(),
                offset = %failed.offset,
                "Error class not retryable, recovering immediately"
            );
            self.tracker.record_failure(failed);
            return self.recover(failed, error);
        }

        let failures = self.tracker.record_failure(failed);
        if failures < self.max_attempts {
            debug!(
                class = %error.class(),
                offset = %failed.offset,
                failures = %failures,
                budget = %self.max_attempts,
                "Delivery failed, will retry"
            );
            if self.seeks_after_handling {
                Decision::SeekAndRetry
            } else {
                Decision::Retain
            }
        } else {
            self.recover(failed, error)
        }
    }
}

impl Default for DefaultErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn handle_record_failure(
        &mut self,
        error: &ListenerError,
        failed: &ConsumerRecord,
        _remaining: &[ConsumerRecord],
        _consumer: &dyn Consumer,
        _container: &ContainerHandle,
    ) -> Decision {
        self.decide(error, failed)
    }

    fn handle_batch_failure(
        &mut self,
        error: &ListenerError,
        records: &[ConsumerRecord],
        _consumer: &dyn Consumer,
        _container: &ContainerHandle,
    ) -> Decision {
        // The whole batch is redelivered together; attempts are tracked on
        // its first record.
        match records.first() {
            Some(first) => self.decide(error, first),
            None => Decision::Handled,
        }
    }

    fn seeks_after_handling(&self) -> bool {
        self.seeks_after_handling
    }

    fn retry_delay_for(&self, record: &ConsumerRecord) -> Duration {
        self.backoff
            .delay_for(self.tracker.failures(record).saturating_sub(1))
    }

    fn record_succeeded(&mut self, record: &ConsumerRecord) {
        self.tracker.clear(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(offset: i64) -> ConsumerRecord {
        ConsumerRecord::new("orders", 0, offset, None, Some(Bytes::from_static(b"v")))
    }

    #[test]
    fn test_allow_list_classifier() {
        let classifier = BinaryErrorClassifier::retry_on(["IllegalStateException"]);
        assert!(classifier.classify("IllegalStateException"));
        assert!(!classifier.classify("SomethingElse"));
    }

    #[test]
    fn test_deny_list_classifier() {
        let classifier = BinaryErrorClassifier::no_retry_on(["FatalError"]);
        assert!(!classifier.classify("FatalError"));
        assert!(classifier.classify("SomethingElse"));
    }

    #[test]
    fn test_default_classifier_rejects_deserialization() {
        let classifier = BinaryErrorClassifier::default();
        assert!(!classifier.classify(DESERIALIZATION_ERROR_CLASS));
        assert!(classifier.classify("IllegalStateException"));
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let backoff = BackOffPolicy::Exponential {
            initial: Duration::from_millis(1000),
            multiplier: 2.0,
            max: Duration::from_millis(60_000),
        };
        assert_eq!(backoff.delay_for(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(60_000));
        assert_eq!(backoff.intervals(3), vec![1000, 2000, 4000]);
        assert!(!backoff.is_constant());
    }

    #[test]
    fn test_failed_record_tracker_counts_per_coordinates() {
        let mut tracker = FailedRecordTracker::new();
        assert_eq!(tracker.record_failure(&record(0)), 1);
        assert_eq!(tracker.record_failure(&record(0)), 2);
        assert_eq!(tracker.record_failure(&record(1)), 1);

        tracker.clear(&record(0));
        assert_eq!(tracker.failures(&record(0)), 0);
        assert_eq!(tracker.failures(&record(1)), 1);
    }

    #[test]
    fn test_retry_delay_uses_failure_count() {
        let mut handler = DefaultErrorHandler::new().with_backoff(BackOffPolicy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        });
        let failed = record(0);
        handler.tracker.record_failure(&failed);
        assert_eq!(handler.retry_delay_for(&failed), Duration::from_millis(100));
        handler.tracker.record_failure(&failed);
        handler.tracker.record_failure(&failed);
        assert_eq!(handler.retry_delay_for(&failed), Duration::from_millis(400));
    }
}
