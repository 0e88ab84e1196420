//! Record and offset types shared by the consumer and producer surfaces

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A topic name plus partition number.
///
/// Equality is by value; ordering is by topic then partition, which keeps
/// offset maps and test assertions deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic partition
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// An offset to commit for a partition.
///
/// `offset` is the next offset to read, not the last one processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetAndMetadata {
    /// Next offset to read
    pub offset: i64,

    /// Optional commit metadata
    pub metadata: String,

    /// Leader epoch of the record batch the offset came from, when known
    pub leader_epoch: Option<i32>,
}

impl OffsetAndMetadata {
    /// Create an offset with empty metadata
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: String::new(),
            leader_epoch: None,
        }
    }

    /// Create an offset with commit metadata
    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: metadata.into(),
            leader_epoch: None,
        }
    }
}

/// Offsets to commit, keyed by partition. Ordered for deterministic
/// commit calls and assertions.
pub type OffsetMap = BTreeMap<TopicPartition, OffsetAndMetadata>;

/// A record header (key-value pair)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header key
    pub key: String,

    /// Header value
    pub value: Bytes,
}

impl Header {
    /// Create a new header
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Find the last header with the given key.
///
/// Kafka allows repeated header keys; the last occurrence wins, matching
/// broker append order.
pub fn last_header<'a>(headers: &'a [Header], key: &str) -> Option<&'a Header> {
    headers.iter().rev().find(|h| h.key == key)
}

/// A record as fetched from a consumer.
///
/// A `None` value together with a deserialization-error header is the
/// sentinel for a record whose payload could not be decoded.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    /// Source topic
    pub topic: String,

    /// Source partition
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Record timestamp (milliseconds since epoch)
    pub timestamp: i64,

    /// Optional record key
    pub key: Option<Bytes>,

    /// Record value; `None` marks an undecodable payload
    pub value: Option<Bytes>,

    /// Record headers
    pub headers: Vec<Header>,
}

impl ConsumerRecord {
    /// Create a record without headers
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: 0,
            key,
            value,
            headers: Vec::new(),
        }
    }

    /// Set the record timestamp
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the record headers
    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    /// The partition this record came from
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Find the last header with the given key
    pub fn header(&self, key: &str) -> Option<&Header> {
        last_header(&self.headers, key)
    }
}

/// A record to publish through a producer
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    /// Destination topic
    pub topic: String,

    /// Destination partition; `None` lets the producer pick
    pub partition: Option<i32>,

    /// Record timestamp (milliseconds since epoch); `None` lets the
    /// producer stamp it
    pub timestamp: Option<i64>,

    /// Optional record key
    pub key: Option<Bytes>,

    /// Record value
    pub value: Option<Bytes>,

    /// Record headers
    pub headers: Vec<Header>,
}

impl ProducerRecord {
    /// Create a record for a topic
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            timestamp: None,
            key,
            value,
            headers: Vec::new(),
        }
    }

    /// Set the destination partition
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the record timestamp
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the record headers
    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }
}

/// Metadata for a successfully published record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Destination topic
    pub topic: String,

    /// Destination partition
    pub partition: i32,

    /// Assigned offset
    pub offset: i64,
}

/// Records returned by a single poll, in client delivery order.
///
/// Records for the same partition appear in ascending offset order;
/// partitions are typically interleaved.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    records: Vec<ConsumerRecord>,
}

impl RecordBatch {
    /// An empty batch
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a batch from records in delivery order
    pub fn from_records(records: Vec<ConsumerRecord>) -> Self {
        Self { records }
    }

    /// Number of records in the batch
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in delivery order
    pub fn records(&self) -> &[ConsumerRecord] {
        &self.records
    }

    /// Consume the batch into its records
    pub fn into_records(self) -> Vec<ConsumerRecord> {
        self.records
    }

    /// Distinct partitions present in the batch, in first-seen order
    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut seen = Vec::new();
        for record in &self.records {
            let tp = record.topic_partition();
            if !seen.contains(&tp) {
                seen.push(tp);
            }
        }
        seen
    }

    /// Split the batch into per-partition sub-batches, in first-seen
    /// partition order, preserving per-partition record order
    pub fn by_partition(&self) -> Vec<(TopicPartition, Vec<ConsumerRecord>)> {
        let mut groups: Vec<(TopicPartition, Vec<ConsumerRecord>)> = Vec::new();
        for record in &self.records {
            let tp = record.topic_partition();
            match groups.iter_mut().find(|(existing, _)| *existing == tp) {
                Some((_, records)) => records.push(record.clone()),
                None => groups.push((tp, vec![record.clone()])),
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_ordering() {
        let a = TopicPartition::new("alpha", 2);
        let b = TopicPartition::new("beta", 0);
        let c = TopicPartition::new("alpha", 3);
        assert!(a < b);
        assert!(a < c);
        assert_eq!(a, TopicPartition::new("alpha", 2));
        assert_eq!(a.to_string(), "alpha-2");
    }

    #[test]
    fn test_last_header_wins() {
        let headers = vec![
            Header::new("k", Bytes::from_static(b"first")),
            Header::new("other", Bytes::from_static(b"x")),
            Header::new("k", Bytes::from_static(b"second")),
        ];
        let found = last_header(&headers, "k").unwrap();
        assert_eq!(found.value, Bytes::from_static(b"second"));
        assert!(last_header(&headers, "missing").is_none());
    }

    #[test]
    fn test_batch_partition_grouping() {
        let batch = RecordBatch::from_records(vec![
            ConsumerRecord::new("foo", 0, 0, None, Some(Bytes::from_static(b"a"))),
            ConsumerRecord::new("foo", 1, 0, None, Some(Bytes::from_static(b"b"))),
            ConsumerRecord::new("foo", 0, 1, None, Some(Bytes::from_static(b"c"))),
        ]);

        assert_eq!(batch.count(), 3);
        let partitions = batch.partitions();
        assert_eq!(
            partitions,
            vec![TopicPartition::new("foo", 0), TopicPartition::new("foo", 1)]
        );

        let groups = batch.by_partition();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[1].offset, 1);
        assert_eq!(groups[1].1.len(), 1);
    }
}
