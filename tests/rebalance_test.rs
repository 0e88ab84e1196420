//! Rebalance behavior:
//!
//! - Revoke pruning of retained records under in-memory retention
//! - Pending offsets committed before a revocation completes
//! - Initial-commit policy on first assignment (`LATEST_ONLY` gating)
//! - Lost partitions never commit

mod common;

use bytes::Bytes;
use common::*;
use conveyor::client::{ConsumerRecord, TopicPartition, TopicSelection};
use conveyor::config::{AssignmentCommitOption, ContainerProperties};
use conveyor::container::{ListenerContext, MessageDispatcher, MessageListenerContainer};
use conveyor::error::ListenerError;
use conveyor::handler::{BackOffPolicy, DefaultErrorHandler};
use conveyor::testing::{ConsumerCall, MockConsumer, MockConsumerFactory};
use conveyor::OffsetResetPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn names(topic: &str) -> TopicSelection {
    TopicSelection::Names(vec![topic.to_string()])
}

#[test]
fn test_revoked_partitions_are_pruned_from_retained_records() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Earliest);
    let partitions: Vec<TopicPartition> =
        (0..4).map(|p| TopicPartition::new("foo", p)).collect();
    consumer.schedule_assignment(partitions.clone());
    for (index, tp) in partitions.iter().enumerate() {
        consumer.produce(
            tp,
            None,
            Some(Bytes::from(format!("payload-{index}"))),
            vec![],
        );
    }

    let log = DeliveryLog::new();
    let log_clone = log.clone();
    let failing = Arc::new(AtomicBool::new(true));
    let failing_clone = failing.clone();
    let dispatcher = MessageDispatcher::record_fn(
        move |record: &ConsumerRecord, _ctx: &mut ListenerContext<'_>| {
            log_clone.record(record);
            if failing_clone.load(Ordering::SeqCst) {
                Err(ListenerError::new("IllegalStateException", "not yet"))
            } else {
                Ok(())
            }
        },
    );

    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        short_properties(names("foo"), "g1"),
        dispatcher,
    )
    .error_handler(
        DefaultErrorHandler::new()
            .with_seeks_after_handling(false)
            .with_max_attempts(10)
            .with_backoff(BackOffPolicy::Fixed {
                delay: Duration::from_millis(500),
            }),
    )
    .build();

    container.start().unwrap();

    // The first failure retains the whole batch and pauses its partitions.
    assert!(wait_until(Duration::from_secs(3), || log.count() >= 1));
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.paused_partitions().len() == 4
    }));

    // Cooperative rebalance takes two of the paused partitions away, and
    // the listener recovers before the retention backoff expires.
    consumer.schedule_revoke(vec![partitions[0].clone(), partitions[2].clone()]);
    failing.store(false, Ordering::SeqCst);

    assert!(wait_until(Duration::from_secs(3), || {
        consumer.committed_offset(&partitions[1]) == Some(1)
            && consumer.committed_offset(&partitions[3]) == Some(1)
    }));
    container.stop().unwrap();

    // No record from a revoked partition reached the listener after the
    // revoke; the survivors were redelivered with their original payloads.
    let after_revoke: Vec<_> = log.deliveries().into_iter().skip(1).collect();
    assert!(after_revoke
        .iter()
        .all(|d| d.tp == partitions[1] || d.tp == partitions[3]));
    assert_eq!(after_revoke.len(), 2);
    assert_eq!(after_revoke[0].value, "payload-1");
    assert_eq!(after_revoke[1].value, "payload-3");
}

#[test]
fn test_pending_offsets_are_committed_before_revocation_completes() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Earliest);
    let tp = TopicPartition::new("foo", 0);
    consumer.schedule_assignment(vec![tp.clone()]);
    consumer.produce(&tp, None, Some(Bytes::from_static(b"a")), vec![]);

    // Count acking keeps the processed offset pending in the tracker.
    let mut properties = short_properties(names("foo"), "g1");
    properties.ack_mode = conveyor::AckMode::Count;
    properties.ack_count = 100;

    let log = DeliveryLog::new();
    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        properties,
        logging_dispatcher(log.clone()),
    )
    .build();

    container.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.count() == 1));
    assert_eq!(consumer.committed_offset(&tp), None);

    consumer.schedule_revoke(vec![tp.clone()]);
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.committed_offset(&tp) == Some(1)
    }));
    container.stop().unwrap();
}

// ── Initial-commit policy (first assignment) ─────────────────────────────

fn latest_only_properties(group: &str) -> ContainerProperties {
    let mut properties = short_properties(names("foo"), group);
    properties.assignment_commit_option = AssignmentCommitOption::LatestOnly;
    properties
}

#[test]
fn test_latest_only_commits_position_on_first_assignment() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Latest);
    let tp = TopicPartition::new("foo", 0);
    // Three pre-existing records; position under `latest` is the log end.
    for value in ["a", "b", "c"] {
        consumer.produce(&tp, None, Some(Bytes::from(value.to_string())), vec![]);
    }
    consumer.schedule_assignment(vec![tp.clone()]);

    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        latest_only_properties("g1"),
        logging_dispatcher(DeliveryLog::new()),
    )
    .build();

    container.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.committed_offset(&tp) == Some(3)
    }));
    container.stop().unwrap();
}

#[test]
fn test_latest_only_does_not_commit_under_earliest_reset() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Earliest);
    let tp = TopicPartition::new("foo", 0);
    consumer.schedule_assignment(vec![tp.clone()]);

    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        latest_only_properties("g1"),
        logging_dispatcher(DeliveryLog::new()),
    )
    .build();

    container.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        !container.assigned_partitions().is_empty()
    }));
    std::thread::sleep(Duration::from_millis(100));
    container.stop().unwrap();

    assert!(!consumer
        .calls()
        .iter()
        .any(|call| matches!(call, ConsumerCall::CommitSync(_))));
}

#[test]
fn test_latest_only_does_not_commit_over_an_existing_offset() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Latest);
    let tp = TopicPartition::new("foo", 0);
    consumer.produce(&tp, None, Some(Bytes::from_static(b"a")), vec![]);
    consumer.set_committed(&tp, 1);
    consumer.schedule_assignment(vec![tp.clone()]);

    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        latest_only_properties("g1"),
        logging_dispatcher(DeliveryLog::new()),
    )
    .build();

    container.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        !container.assigned_partitions().is_empty()
    }));
    std::thread::sleep(Duration::from_millis(100));
    container.stop().unwrap();

    assert_eq!(consumer.committed_offset(&tp), Some(1));
    assert!(!consumer
        .calls()
        .iter()
        .any(|call| matches!(call, ConsumerCall::CommitSync(_))));
}

#[test]
fn test_never_option_skips_the_initial_commit() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Latest);
    let tp = TopicPartition::new("foo", 0);
    consumer.produce(&tp, None, Some(Bytes::from_static(b"a")), vec![]);
    consumer.schedule_assignment(vec![tp.clone()]);

    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        short_properties(names("foo"), "g1"),
        logging_dispatcher(DeliveryLog::new()),
    )
    .build();

    container.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        !container.assigned_partitions().is_empty()
    }));
    std::thread::sleep(Duration::from_millis(100));
    container.stop().unwrap();

    assert_eq!(consumer.committed_offset(&tp), None);
}

// ── Lost partitions ──────────────────────────────────────────────────────

#[test]
fn test_lost_partitions_never_commit() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Earliest);
    let tp = TopicPartition::new("foo", 0);
    consumer.schedule_assignment(vec![tp.clone()]);
    consumer.produce(&tp, None, Some(Bytes::from_static(b"a")), vec![]);

    // Keep the processed offset pending so a (wrong) commit would show up.
    let mut properties = short_properties(names("foo"), "g1");
    properties.ack_mode = conveyor::AckMode::Count;
    properties.ack_count = 100;

    let log = DeliveryLog::new();
    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        properties,
        logging_dispatcher(log.clone()),
    )
    .build();

    container.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.count() == 1));

    consumer.schedule_lost(vec![tp.clone()]);
    assert!(wait_until(Duration::from_secs(3), || {
        container.assigned_partitions().is_empty()
    }));
    container.stop().unwrap();

    // The offset was already owned elsewhere; nothing was committed.
    assert_eq!(consumer.committed_offset(&tp), None);
}
