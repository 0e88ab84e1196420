//! Next-hop and dead-letter publishing
//!
//! Rewrites a failed record for the next destination in its chain and
//! publishes it through the pooled producer factory. Terminal dead-letter
//! publishes additionally carry a JSON metadata header with the full
//! failure context.

use crate::client::{ConsumerRecord, Header, Producer, ProducerRecord};
use crate::error::{ConveyorError, ListenerError, Result};
use crate::handler::RecordRecoverer;
use crate::producer::PooledProducerFactory;
use crate::retry::headers;
use crate::retry::{DestinationTopic, DestinationTopicResolver, DltStrategy};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Metadata stored with terminal dead-letter records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMetadata {
    /// Topic of the first failure
    pub original_topic: String,

    /// Partition of the first failure
    pub original_partition: i32,

    /// Offset of the first failure
    pub original_offset: i64,

    /// Timestamp of the original record
    pub original_timestamp: i64,

    /// Error class of the final failure
    pub error_class: String,

    /// Error message of the final failure
    pub error_message: String,

    /// When the record was dead-lettered (epoch millis)
    pub error_timestamp: i64,

    /// Total failed deliveries across the chain
    pub attempts: u32,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Publishes failed records to the next destination in their chain
pub struct DeadLetterPublisher {
    resolver: Arc<DestinationTopicResolver>,
    producers: Arc<PooledProducerFactory>,
    send_timeout: Duration,
}

impl DeadLetterPublisher {
    /// Default broker-ack wait per publish
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a publisher over a registered resolver
    pub fn new(
        resolver: Arc<DestinationTopicResolver>,
        producers: Arc<PooledProducerFactory>,
    ) -> Self {
        Self {
            resolver,
            producers,
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Set the broker-ack wait per publish
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Route a failed record to its next destination. Returns the
    /// destination it was published to, or `None` for a no-op terminal.
    pub fn route(
        &self,
        record: &ConsumerRecord,
        error: &ListenerError,
    ) -> Result<Option<Arc<DestinationTopic>>> {
        let attempts = headers::attempts(record) + 1;
        let now = now_ms();
        let destination = self.resolver.next_destination(
            &record.topic,
            attempts,
            error.class(),
            headers::original_timestamp(record),
            now,
        )?;

        if destination.is_no_ops() {
            info!(
                topic = %record.topic,
                offset = %record.offset,
                attempts = %attempts,
                error = %error,
                "Retries exhausted with no dead-letter topic, dropping record"
            );
            return Ok(None);
        }

        match self.publish(record, error, attempts, now, &destination) {
            Ok(()) => Ok(Some(destination)),
            Err(publish_error) => self.handle_publish_failure(
                record,
                error,
                attempts,
                now,
                &destination,
                publish_error,
            ),
        }
    }

    fn handle_publish_failure(
        &self,
        record: &ConsumerRecord,
        error: &ListenerError,
        attempts: u32,
        now: i64,
        destination: &Arc<DestinationTopic>,
        publish_error: ConveyorError,
    ) -> Result<Option<Arc<DestinationTopic>>> {
        match destination.dlt_strategy() {
            // A failed dead-letter publish loops the record back through
            // the last retry topic instead of propagating.
            DltStrategy::AlwaysRetryOnError if destination.is_dlt() => {
                warn!(
                    destination = %destination.name(),
                    error = %publish_error,
                    "Dead-letter publish failed, looping back to retry"
                );
                let retry = self
                    .resolver
                    .last_retry_for(&record.topic)
                    .ok_or(publish_error)?;
                self.publish(record, error, attempts, now, &retry)?;
                Ok(Some(retry))
            }
            _ => Err(ConveyorError::DeadLetterPublish(format!(
                "{}: {publish_error}",
                destination.name()
            ))),
        }
    }

    fn publish(
        &self,
        record: &ConsumerRecord,
        error: &ListenerError,
        attempts: u32,
        now: i64,
        destination: &Arc<DestinationTopic>,
    ) -> Result<()> {
        let deadline = destination
            .is_retry()
            .then(|| now + destination.delay_ms() as i64);
        let mut hop_headers = headers::next_hop_headers(record, error, attempts, deadline);

        if destination.is_dlt() {
            let metadata = DeadLetterMetadata {
                original_topic: headers::original_topic(record),
                original_partition: headers::original_partition(record),
                original_offset: headers::original_offset(record),
                original_timestamp: headers::original_timestamp(record),
                error_class: error.class().to_string(),
                error_message: error.message().to_string(),
                error_timestamp: now,
                attempts,
            };
            hop_headers.push(Header::new(
                headers::HEADER_DLT_METADATA,
                Bytes::from(serde_json::to_string(&metadata)?),
            ));
        }

        let num_partitions = destination.properties().num_partitions;
        let mut outgoing = ProducerRecord::new(
            destination.name().to_string(),
            record.key.clone(),
            record.value.clone(),
        )
        .with_headers(hop_headers)
        .with_timestamp(record.timestamp);
        // Keep the original partition when the destination is wide enough;
        // otherwise let the producer pick.
        if record.partition >= 0 && record.partition < num_partitions {
            outgoing = outgoing.with_partition(record.partition);
        }

        let producer = self.producers.create_producer()?;
        let transactional = self.producers.is_transactional();
        if transactional {
            producer.begin_transaction()?;
        }
        let result = producer
            .send(outgoing)
            .and_then(|future| future.get(self.send_timeout))
            .map(|_| ());
        let result = if transactional {
            match result {
                Ok(()) => producer.commit_transaction(),
                Err(e) => {
                    let _ = producer.abort_transaction();
                    Err(e)
                }
            }
        } else {
            result.and_then(|()| producer.flush())
        };

        match &result {
            Ok(()) => info!(
                destination = %destination.name(),
                original_topic = %headers::original_topic(record),
                original_offset = %headers::original_offset(record),
                attempts = %attempts,
                error = %error,
                "Record routed to next destination"
            ),
            Err(e) => warn!(
                destination = %destination.name(),
                error = %e,
                "Publish to destination failed"
            ),
        }
        result
    }
}

impl RecordRecoverer for DeadLetterPublisher {
    fn recover(
        &self,
        record: &ConsumerRecord,
        error: &ListenerError,
        _attempts: u32,
    ) -> Result<()> {
        self.route(record, error).map(|_| ())
    }

    fn is_dead_letter(&self) -> bool {
        true
    }
}
