//! Retry header codec
//!
//! Failed records carry their history in headers: where they came from,
//! how many deliveries failed, what the error was, and when the next
//! delivery is due. Integers are big-endian; strings are UTF-8.

use crate::client::{ConsumerRecord, Header};
use crate::error::ListenerError;
use bytes::Bytes;

/// Original topic of the first failure
pub const HEADER_ORIGINAL_TOPIC: &str = "x-retry-original-topic";

/// Original partition (int32 big-endian)
pub const HEADER_ORIGINAL_PARTITION: &str = "x-retry-original-partition";

/// Original offset (int64 big-endian)
pub const HEADER_ORIGINAL_OFFSET: &str = "x-retry-original-offset";

/// Original record timestamp, epoch millis (int64 big-endian)
pub const HEADER_ORIGINAL_TIMESTAMP: &str = "x-retry-original-timestamp";

/// Failed delivery count so far (int32 big-endian)
pub const HEADER_ATTEMPTS: &str = "x-retry-attempts";

/// Error class of the last failure
pub const HEADER_EXCEPTION_CLASS: &str = "x-retry-exception-class";

/// Error message of the last failure
pub const HEADER_EXCEPTION_MESSAGE: &str = "x-retry-exception-message";

/// Captured failure rendering of the last failure
pub const HEADER_EXCEPTION_STACKTRACE: &str = "x-retry-exception-stacktrace";

/// Epoch millis before which the record must not be redelivered
/// (int64 big-endian)
pub const HEADER_BACKOFF_DEADLINE: &str = "x-retry-backoff-deadline";

/// Terminal dead-letter metadata (JSON), stamped only on DLT publishes
pub const HEADER_DLT_METADATA: &str = "x-dlt-metadata";

/// Header reporting a payload that could not be decoded
pub const HEADER_DESERIALIZATION_ERROR: &str = "x-deserialization-error";

fn i32_bytes(value: i32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn i64_bytes(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn read_i32(record: &ConsumerRecord, key: &str) -> Option<i32> {
    let header = record.header(key)?;
    let bytes: [u8; 4] = header.value.as_ref().try_into().ok()?;
    Some(i32::from_be_bytes(bytes))
}

fn read_i64(record: &ConsumerRecord, key: &str) -> Option<i64> {
    let header = record.header(key)?;
    let bytes: [u8; 8] = header.value.as_ref().try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

fn read_string(record: &ConsumerRecord, key: &str) -> Option<String> {
    let header = record.header(key)?;
    String::from_utf8(header.value.to_vec()).ok()
}

/// Failed deliveries recorded on the record; zero when absent
pub fn attempts(record: &ConsumerRecord) -> u32 {
    read_i32(record, HEADER_ATTEMPTS).map(|v| v.max(0) as u32).unwrap_or(0)
}

/// Redelivery deadline, when present
pub fn backoff_deadline(record: &ConsumerRecord) -> Option<i64> {
    read_i64(record, HEADER_BACKOFF_DEADLINE)
}

/// Topic of the first failure; falls back to the record's own topic
pub fn original_topic(record: &ConsumerRecord) -> String {
    read_string(record, HEADER_ORIGINAL_TOPIC).unwrap_or_else(|| record.topic.clone())
}

/// Partition of the first failure; falls back to the record's own
pub fn original_partition(record: &ConsumerRecord) -> i32 {
    read_i32(record, HEADER_ORIGINAL_PARTITION).unwrap_or(record.partition)
}

/// Offset of the first failure; falls back to the record's own
pub fn original_offset(record: &ConsumerRecord) -> i64 {
    read_i64(record, HEADER_ORIGINAL_OFFSET).unwrap_or(record.offset)
}

/// Timestamp of the first failure; falls back to the record's own
pub fn original_timestamp(record: &ConsumerRecord) -> i64 {
    read_i64(record, HEADER_ORIGINAL_TIMESTAMP).unwrap_or(record.timestamp)
}

/// Headers for the next hop of a failed record.
///
/// Strips this codec's headers from the source record and re-stamps them
/// with the original coordinates preserved from the first failure.
pub fn next_hop_headers(
    record: &ConsumerRecord,
    error: &ListenerError,
    attempts: u32,
    backoff_deadline_ms: Option<i64>,
) -> Vec<Header> {
    let mut headers: Vec<Header> = record
        .headers
        .iter()
        .filter(|h| !h.key.starts_with("x-retry-") && h.key != HEADER_DLT_METADATA)
        .cloned()
        .collect();

    headers.push(Header::new(
        HEADER_ORIGINAL_TOPIC,
        Bytes::from(original_topic(record)),
    ));
    headers.push(Header::new(
        HEADER_ORIGINAL_PARTITION,
        i32_bytes(original_partition(record)),
    ));
    headers.push(Header::new(
        HEADER_ORIGINAL_OFFSET,
        i64_bytes(original_offset(record)),
    ));
    headers.push(Header::new(
        HEADER_ORIGINAL_TIMESTAMP,
        i64_bytes(original_timestamp(record)),
    ));
    headers.push(Header::new(HEADER_ATTEMPTS, i32_bytes(attempts as i32)));
    headers.push(Header::new(
        HEADER_EXCEPTION_CLASS,
        Bytes::from(error.class().to_string()),
    ));
    headers.push(Header::new(
        HEADER_EXCEPTION_MESSAGE,
        Bytes::from(error.message().to_string()),
    ));
    if let Some(capture) = error.capture() {
        headers.push(Header::new(
            HEADER_EXCEPTION_STACKTRACE,
            Bytes::from(capture.to_string()),
        ));
    }
    if let Some(deadline) = backoff_deadline_ms {
        headers.push(Header::new(HEADER_BACKOFF_DEADLINE, i64_bytes(deadline)));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_record() -> ConsumerRecord {
        ConsumerRecord::new(
            "orders-retry-1000",
            2,
            40,
            None,
            Some(Bytes::from_static(b"payload")),
        )
        .with_timestamp(1_000)
        .with_headers(vec![
            Header::new("app-header", Bytes::from_static(b"keep")),
            Header::new(HEADER_ORIGINAL_TOPIC, Bytes::from_static(b"orders")),
            Header::new(HEADER_ORIGINAL_PARTITION, i32_bytes(0)),
            Header::new(HEADER_ORIGINAL_OFFSET, i64_bytes(7)),
            Header::new(HEADER_ORIGINAL_TIMESTAMP, i64_bytes(500)),
            Header::new(HEADER_ATTEMPTS, i32_bytes(1)),
        ])
    }

    #[test]
    fn test_reads_fall_back_to_record_fields() {
        let bare = ConsumerRecord::new("orders", 3, 9, None, None).with_timestamp(777);
        assert_eq!(attempts(&bare), 0);
        assert_eq!(original_topic(&bare), "orders");
        assert_eq!(original_partition(&bare), 3);
        assert_eq!(original_offset(&bare), 9);
        assert_eq!(original_timestamp(&bare), 777);
        assert!(backoff_deadline(&bare).is_none());
    }

    #[test]
    fn test_next_hop_preserves_original_coordinates() {
        let record = failed_record();
        let error = ListenerError::new("IllegalStateException", "boom").with_capture("at ...");
        let headers = next_hop_headers(&record, &error, 2, Some(10_000));

        let hopped = ConsumerRecord::new("orders-retry-2000", 0, 0, None, None)
            .with_headers(headers.clone());
        assert_eq!(original_topic(&hopped), "orders");
        assert_eq!(original_partition(&hopped), 0);
        assert_eq!(original_offset(&hopped), 7);
        assert_eq!(original_timestamp(&hopped), 500);
        assert_eq!(attempts(&hopped), 2);
        assert_eq!(backoff_deadline(&hopped), Some(10_000));

        // Application headers survive; stale retry headers do not repeat.
        assert_eq!(
            headers.iter().filter(|h| h.key == HEADER_ATTEMPTS).count(),
            1
        );
        assert!(headers.iter().any(|h| h.key == "app-header"));
    }

    #[test]
    fn test_exception_headers() {
        let record = failed_record();
        let error = ListenerError::new("IllegalStateException", "boom").with_capture("trace");
        let hopped = ConsumerRecord::new("orders-dlt", 0, 0, None, None)
            .with_headers(next_hop_headers(&record, &error, 3, None));

        assert_eq!(
            read_string(&hopped, HEADER_EXCEPTION_CLASS).as_deref(),
            Some("IllegalStateException")
        );
        assert_eq!(
            read_string(&hopped, HEADER_EXCEPTION_MESSAGE).as_deref(),
            Some("boom")
        );
        assert_eq!(
            read_string(&hopped, HEADER_EXCEPTION_STACKTRACE).as_deref(),
            Some("trace")
        );
        assert!(backoff_deadline(&hopped).is_none());
    }
}
