//! After-rollback processing
//!
//! Runs after a transactional abort to decide what happens to the records
//! whose work was rolled back. The default seeks every affected partition
//! back to its first rolled-back offset so the next poll redelivers them.

use crate::client::{Consumer, ConsumerRecord, TopicPartition};
use crate::error::{ListenerError, Result};
use crate::handler::RecordRecoverer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hook invoked after `abort_transaction`
pub trait AfterRollbackProcessor: Send {
    /// Process the rolled-back records. Runs on the poll thread with the
    /// consumer available for seeks.
    fn process(
        &mut self,
        records: &[ConsumerRecord],
        consumer: &dyn Consumer,
        error: &ListenerError,
    ) -> Result<()>;
}

/// Default processor: seek each partition to its first rolled-back offset.
///
/// With batch recovery enabled, records matching the predicate are handed
/// to the recoverer instead of being redelivered; only the rest are seeked.
pub struct DefaultAfterRollbackProcessor {
    recoverer: Option<Arc<dyn RecordRecoverer>>,
    recover_predicate: Option<Box<dyn Fn(&ConsumerRecord, &ListenerError) -> bool + Send>>,
}

impl DefaultAfterRollbackProcessor {
    /// Processor that only seeks
    pub fn new() -> Self {
        Self {
            recoverer: None,
            recover_predicate: None,
        }
    }

    /// Enable batch recovery: records matching the predicate are recovered
    /// before the remaining partitions are seeked
    pub fn with_recovery(
        mut self,
        recoverer: Arc<dyn RecordRecoverer>,
        predicate: impl Fn(&ConsumerRecord, &ListenerError) -> bool + Send + 'static,
    ) -> Self {
        self.recoverer = Some(recoverer);
        self.recover_predicate = Some(Box::new(predicate));
        self
    }
}

impl Default for DefaultAfterRollbackProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AfterRollbackProcessor for DefaultAfterRollbackProcessor {
    fn process(
        &mut self,
        records: &[ConsumerRecord],
        consumer: &dyn Consumer,
        error: &ListenerError,
    ) -> Result<()> {
        let mut seek_targets: BTreeMap<TopicPartition, i64> = BTreeMap::new();

        for record in records {
            let recovered = match (&self.recoverer, &self.recover_predicate) {
                (Some(recoverer), Some(predicate)) if predicate(record, error) => {
                    match recoverer.recover(record, error, 1) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                topic = %record.topic,
                                partition = %record.partition,
                                offset = %record.offset,
                                error = %e,
                                "Rollback recovery failed, record will be redelivered"
                            );
                            false
                        }
                    }
                }
                _ => false,
            };

            if !recovered {
                let tp = record.topic_partition();
                let entry = seek_targets.entry(tp).or_insert(record.offset);
                if record.offset < *entry {
                    *entry = record.offset;
                }
            }
        }

        for (tp, offset) in seek_targets {
            debug!(partition = %tp, offset = %offset, "Seeking after rollback");
            consumer.seek(&tp, offset)?;
        }
        Ok(())
    }
}
