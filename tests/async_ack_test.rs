//! Out-of-order acknowledgment (gap) behavior:
//!
//! - A deferred ack blocks the commit at the gap and pauses the partition
//! - Acking the gap advances the commit over everything behind it and
//!   resumes the partition
//! - Commits stay monotonic throughout

mod common;

use bytes::Bytes;
use common::*;
use conveyor::client::{ConsumerRecord, TopicPartition, TopicSelection};
use conveyor::config::AckMode;
use conveyor::container::{Acknowledgment, ListenerContext, MessageDispatcher, MessageListenerContainer};
use conveyor::error::ListenerError;
use conveyor::testing::{MockConsumer, MockConsumerFactory};
use conveyor::OffsetResetPolicy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_gap_blocks_commit_and_pauses_until_acked() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Earliest);
    let tp = TopicPartition::new("p", 0);
    consumer.schedule_assignment(vec![tp.clone()]);
    for offset in 0..10 {
        consumer.produce(&tp, None, Some(Bytes::from(format!("v{offset}"))), vec![]);
    }

    // Every record acks immediately except offset 5, whose handle is
    // parked for later.
    let deferred: Arc<Mutex<Option<Acknowledgment>>> = Arc::new(Mutex::new(None));
    let deferred_clone = deferred.clone();
    let log = DeliveryLog::new();
    let log_clone = log.clone();
    let dispatcher = MessageDispatcher::record_fn(
        move |record: &ConsumerRecord, ctx: &mut ListenerContext<'_>| {
            log_clone.record(record);
            if let Some(ack) = ctx.ack.take() {
                if record.offset == 5 {
                    *deferred_clone.lock() = Some(ack);
                } else {
                    ack.acknowledge();
                }
            }
            Ok::<(), ListenerError>(())
        },
    );

    let mut properties = short_properties(
        TopicSelection::Names(vec!["p".to_string()]),
        "g1",
    );
    properties.ack_mode = AckMode::Manual;
    properties.async_acks = true;

    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        properties,
        dispatcher,
    )
    .build();

    container.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.count() == 10));

    // The fully-acked prefix 0..4 commits; offset 5 blocks the rest and
    // the partition pauses until the gap closes.
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.committed_offset(&tp) == Some(5)
    }));
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.paused_partitions().contains(&tp)
    }));

    // No further deliveries while the gap is open.
    consumer.produce(&tp, None, Some(Bytes::from_static(b"v10")), vec![]);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(log.count(), 10);

    // Closing the gap releases 6..9 and resumes the partition.
    deferred
        .lock()
        .take()
        .expect("handle for offset 5 parked")
        .acknowledge();
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.committed_offset(&tp) == Some(10)
    }));
    assert!(wait_until(Duration::from_secs(3), || {
        !consumer.paused_partitions().contains(&tp)
    }));

    // The partition flows again after the gap closes.
    assert!(wait_until(Duration::from_secs(3), || log.count() == 11));
    container.stop().unwrap();

    // Monotonic commits: 5 then 10 then 11, never backwards.
    let committed = consumer.committed_offset(&tp);
    assert_eq!(committed, Some(11));
}
