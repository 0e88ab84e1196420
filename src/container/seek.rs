//! Deferred consumer seeks
//!
//! User code never touches the consumer directly. A [`SeekHandle`] queues
//! seek requests from any thread; the poll loop drains and applies them at
//! the top of each iteration, when it owns the consumer.

use crate::client::{Consumer, TopicPartition};
use crate::error::Result;
use std::collections::HashMap;
use tracing::debug;

/// A seek to apply on the poll thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekRequest {
    /// Seek to an absolute offset
    Absolute { tp: TopicPartition, offset: i64 },

    /// Seek relative to the current position; negative moves back
    Relative { tp: TopicPartition, delta: i64 },

    /// Seek to the earliest offset whose timestamp is at or after the
    /// given epoch millis; no-op when no such record exists
    ToTimestamp { tp: TopicPartition, timestamp_ms: i64 },

    /// Seek to the earliest available offset
    ToBeginning { partitions: Vec<TopicPartition> },

    /// Seek to the log end
    ToEnd { partitions: Vec<TopicPartition> },
}

/// Cloneable handle that defers seeks to the poll thread
#[derive(Clone)]
pub struct SeekHandle {
    tx: crossbeam_channel::Sender<SeekRequest>,
}

impl SeekHandle {
    /// Create a handle plus the receiver drained by the poll loop
    pub fn channel() -> (SeekHandle, crossbeam_channel::Receiver<SeekRequest>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (SeekHandle { tx }, rx)
    }

    /// Queue a seek to an absolute offset
    pub fn seek(&self, tp: TopicPartition, offset: i64) {
        let _ = self.tx.send(SeekRequest::Absolute { tp, offset });
    }

    /// Queue a seek relative to the current position
    pub fn seek_relative(&self, tp: TopicPartition, delta: i64) {
        let _ = self.tx.send(SeekRequest::Relative { tp, delta });
    }

    /// Queue a seek to the first offset at or after a timestamp
    pub fn seek_to_timestamp(&self, tp: TopicPartition, timestamp_ms: i64) {
        let _ = self.tx.send(SeekRequest::ToTimestamp { tp, timestamp_ms });
    }

    /// Queue a seek to the earliest available offset
    pub fn seek_to_beginning(&self, partitions: Vec<TopicPartition>) {
        let _ = self.tx.send(SeekRequest::ToBeginning { partitions });
    }

    /// Queue a seek to the log end
    pub fn seek_to_end(&self, partitions: Vec<TopicPartition>) {
        let _ = self.tx.send(SeekRequest::ToEnd { partitions });
    }
}

/// Apply one queued seek against the consumer. Runs on the poll thread.
pub(crate) fn apply_seek(consumer: &dyn Consumer, request: &SeekRequest) -> Result<()> {
    match request {
        SeekRequest::Absolute { tp, offset } => {
            debug!(partition = %tp, offset = %offset, "Applying deferred seek");
            consumer.seek(tp, *offset)
        }
        SeekRequest::Relative { tp, delta } => {
            let position = consumer.position(tp)?;
            let target = (position + delta).max(0);
            debug!(partition = %tp, position = %position, target = %target, "Applying relative seek");
            consumer.seek(tp, target)
        }
        SeekRequest::ToTimestamp { tp, timestamp_ms } => {
            let mut query = HashMap::new();
            query.insert(tp.clone(), *timestamp_ms);
            let offsets = consumer.offsets_for_times(&query)?;
            match offsets.get(tp).copied().flatten() {
                Some(offset) => {
                    debug!(partition = %tp, timestamp_ms = %timestamp_ms, offset = %offset, "Applying timestamp seek");
                    consumer.seek(tp, offset)
                }
                None => {
                    debug!(partition = %tp, timestamp_ms = %timestamp_ms, "No offset for timestamp, skipping seek");
                    Ok(())
                }
            }
        }
        SeekRequest::ToBeginning { partitions } => consumer.seek_to_beginning(partitions),
        SeekRequest::ToEnd { partitions } => consumer.seek_to_end(partitions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_handle_queues_in_order() {
        let (handle, rx) = SeekHandle::channel();
        let tp = TopicPartition::new("orders", 0);

        handle.seek(tp.clone(), 5);
        handle.seek_relative(tp.clone(), -2);
        handle.seek_to_end(vec![tp.clone()]);

        let requests: Vec<SeekRequest> = rx.try_iter().collect();
        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests[0],
            SeekRequest::Absolute {
                tp: tp.clone(),
                offset: 5
            }
        );
        assert_eq!(
            requests[1],
            SeekRequest::Relative {
                tp: tp.clone(),
                delta: -2
            }
        );
        assert_eq!(requests[2], SeekRequest::ToEnd { partitions: vec![tp] });
    }
}
