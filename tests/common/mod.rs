//! Shared helpers for container integration tests

#![allow(dead_code)]

use conveyor::client::{ConsumerRecord, TopicPartition, TopicSelection};
use conveyor::config::{AckMode, AssignmentCommitOption, ContainerProperties};
use conveyor::container::{ListenerContext, MessageDispatcher};
use conveyor::error::ListenerError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Install a per-test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses; returns whether it held
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Container properties tuned for fast tests: short polls, no initial
/// assignment commit
pub fn short_properties(selection: TopicSelection, group_id: &str) -> ContainerProperties {
    ContainerProperties::builder(selection, group_id)
        .poll_timeout(Duration::from_millis(50))
        .shutdown_timeout(Duration::from_secs(2))
        .sync_commit_timeout(Duration::from_secs(1))
        .assignment_commit_option(AssignmentCommitOption::Never)
        .build()
}

/// Same as [`short_properties`] with an explicit ack mode
pub fn short_properties_with_ack(
    selection: TopicSelection,
    group_id: &str,
    ack_mode: AckMode,
) -> ContainerProperties {
    let mut properties = short_properties(selection, group_id);
    properties.ack_mode = ack_mode;
    properties
}

/// One recorded delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tp: TopicPartition,
    pub offset: i64,
    pub value: String,
}

/// Captures every listener delivery for assertions
#[derive(Clone, Default)]
pub struct DeliveryLog {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: &ConsumerRecord) {
        self.deliveries.lock().push(Delivery {
            tp: record.topic_partition(),
            offset: record.offset,
            value: record
                .value
                .as_ref()
                .map(|v| String::from_utf8_lossy(v).to_string())
                .unwrap_or_default(),
        });
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn values(&self) -> Vec<String> {
        self.deliveries.lock().iter().map(|d| d.value.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn count_for(&self, tp: &TopicPartition) -> usize {
        self.deliveries.lock().iter().filter(|d| &d.tp == tp).count()
    }
}

/// A record dispatcher that logs deliveries and always succeeds
pub fn logging_dispatcher(log: DeliveryLog) -> MessageDispatcher {
    MessageDispatcher::record_fn(
        move |record: &ConsumerRecord, _ctx: &mut ListenerContext<'_>| {
            log.record(record);
            Ok::<(), ListenerError>(())
        },
    )
}
