//! Per-record acknowledgment handles

use crate::client::TopicPartition;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What an acknowledgment handle reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckSignal {
    /// The record was processed; its offset is eligible to commit
    Ack,
    /// The record must be redelivered after the given backoff; the
    /// partition pauses until then
    Nack { sleep: Duration },
}

/// A signal routed back to the poll loop
#[derive(Debug, Clone)]
pub struct AckMessage {
    /// Partition of the acknowledged record
    pub tp: TopicPartition,

    /// Offset of the acknowledged record
    pub offset: i64,

    /// Ack or pause-and-retry
    pub signal: AckSignal,
}

/// Token handed to listeners under the manual ack modes.
///
/// Cloneable and usable from any thread; the poll loop drains signals at
/// its commit boundaries. Acknowledging twice is a no-op.
#[derive(Clone)]
pub struct Acknowledgment {
    tp: TopicPartition,
    offset: i64,
    tx: crossbeam_channel::Sender<AckMessage>,
    consumed: Arc<AtomicBool>,
}

impl Acknowledgment {
    /// Create a handle for one delivered record
    pub(crate) fn new(
        tp: TopicPartition,
        offset: i64,
        tx: crossbeam_channel::Sender<AckMessage>,
    ) -> Self {
        Self {
            tp,
            offset,
            tx,
            consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The record this handle acknowledges
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    /// The offset this handle acknowledges
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Mark the record processed
    pub fn acknowledge(&self) {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(AckMessage {
            tp: self.tp.clone(),
            offset: self.offset,
            signal: AckSignal::Ack,
        });
    }

    /// Reject the record: seek back to it and pause its partition for
    /// `sleep` before redelivery
    pub fn nack(&self, sleep: Duration) {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(AckMessage {
            tp: self.tp.clone(),
            offset: self.offset,
            signal: AckSignal::Nack { sleep },
        });
    }
}
