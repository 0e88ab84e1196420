//! Retry-topic engine, end to end:
//!
//! - A record failing with a retryable class walks the chain
//!   `orders → orders-retry-1000 → orders-retry-2000 → orders-retry-4000 →
//!   orders-dlt`, with attempts and deadline headers stamped per hop
//! - The consuming container honors the backoff deadline by pausing the
//!   partition until the record is due
//! - Dead-letter strategies: silent drop under `NoDlt`, loop-back under
//!   `AlwaysRetryOnError`, propagation under `FailOnError`

mod common;

use bytes::Bytes;
use common::*;
use conveyor::client::{ConsumerRecord, ProducerRecord, TopicPartition, TopicSelection};
use conveyor::container::MessageListenerContainer;
use conveyor::error::ListenerError;
use conveyor::handler::{DefaultErrorHandler, RecordRecoverer};
use conveyor::producer::PooledProducerFactory;
use conveyor::retry::headers;
use conveyor::retry::{
    DeadLetterPublisher, DestinationTopicResolver, DltStrategy, RetryTopicConfiguration,
};
use conveyor::testing::{MockConsumer, MockConsumerFactory, MockProducer, MockProducerFactory};
use conveyor::{ConveyorError, OffsetResetPolicy};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn exponential_config() -> RetryTopicConfiguration {
    RetryTopicConfiguration::builder()
        .max_attempts(3)
        .exponential_backoff(Duration::from_millis(1000), 2.0, Duration::from_secs(60))
        .retry_on(["IllegalStateException"])
        .build()
}

fn publisher_over(
    producer: MockProducer,
    resolver: Arc<DestinationTopicResolver>,
) -> DeadLetterPublisher {
    let factory = Arc::new(PooledProducerFactory::non_transactional(Arc::new(
        MockProducerFactory::new(producer),
    )));
    DeadLetterPublisher::new(resolver, factory).with_send_timeout(Duration::from_secs(1))
}

/// Re-feed a published record as if it were consumed from its topic
fn as_consumed(record: &ProducerRecord, offset: i64) -> ConsumerRecord {
    ConsumerRecord::new(
        record.topic.clone(),
        record.partition.unwrap_or(0),
        offset,
        record.key.clone(),
        record.value.clone(),
    )
    .with_timestamp(record.timestamp.unwrap_or(0))
    .with_headers(record.headers.clone())
}

#[test]
fn test_failing_record_walks_the_whole_chain() {
    init_tracing();
    let resolver = Arc::new(DestinationTopicResolver::new());
    let chain = resolver.register("orders", &exponential_config());
    let names: Vec<&str> = chain.iter().map(|d| d.name()).collect();
    assert_eq!(
        names,
        vec![
            "orders",
            "orders-retry-1000",
            "orders-retry-2000",
            "orders-retry-4000",
            "orders-dlt"
        ]
    );

    let producer = MockProducer::new();
    let publisher = publisher_over(producer.clone(), resolver);
    let error = ListenerError::new("IllegalStateException", "X is broken");

    // Original delivery fails on the main topic.
    let original = ConsumerRecord::new(
        "orders",
        0,
        7,
        Some(Bytes::from_static(b"key")),
        Some(Bytes::from_static(b"X")),
    )
    .with_timestamp(now_ms());

    let mut current = original.clone();
    let expected_hops = [
        ("orders-retry-1000", 1, Some(1000)),
        ("orders-retry-2000", 2, Some(2000)),
        ("orders-retry-4000", 3, Some(4000)),
        ("orders-dlt", 4, None),
    ];
    for (expected_topic, expected_attempts, expected_delay) in expected_hops {
        let before = now_ms();
        let destination = publisher
            .route(&current, &error)
            .unwrap()
            .expect("record routed somewhere");
        assert_eq!(destination.name(), expected_topic);

        let sent = producer.sent_records().pop().unwrap();
        assert_eq!(sent.topic, expected_topic);
        assert_eq!(sent.value.as_deref(), Some(b"X".as_ref()));

        let hopped = as_consumed(&sent, 0);
        assert_eq!(headers::attempts(&hopped), expected_attempts);
        assert_eq!(headers::original_topic(&hopped), "orders");
        assert_eq!(headers::original_offset(&hopped), 7);
        match expected_delay {
            Some(delay) => {
                let deadline = headers::backoff_deadline(&hopped).unwrap();
                let lag = deadline - before;
                assert!(
                    (delay - 500..=delay + 1500).contains(&lag),
                    "deadline {lag}ms off for {expected_topic}"
                );
            }
            None => {
                assert!(headers::backoff_deadline(&hopped).is_none());
                assert!(hopped.header(headers::HEADER_DLT_METADATA).is_some());
            }
        }
        current = hopped;
    }

    // Four hops published in total.
    assert_eq!(producer.sent_records().len(), 4);
}

#[test]
fn test_container_honors_the_backoff_deadline() {
    init_tracing();
    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Earliest);
    let tp = TopicPartition::new("orders-retry-1000", 0);
    consumer.schedule_assignment(vec![tp.clone()]);

    // A record due 300 ms from now, as the retry publisher would stamp it.
    let base = ConsumerRecord::new("orders", 0, 3, None, Some(Bytes::from_static(b"later")));
    let error = ListenerError::new("IllegalStateException", "first failure");
    let hop_headers = headers::next_hop_headers(&base, &error, 1, Some(now_ms() + 300));
    consumer.produce_with_timestamp(&tp, Some(Bytes::from_static(b"later")), hop_headers, now_ms());

    let log = DeliveryLog::new();
    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        short_properties(
            TopicSelection::Names(vec!["orders-retry-1000".to_string()]),
            "g1",
        ),
        logging_dispatcher(log.clone()),
    )
    .build();

    let started = std::time::Instant::now();
    container.start().unwrap();

    // The partition pauses instead of delivering early.
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.paused_partitions().contains(&tp)
    }));
    assert_eq!(log.count(), 0);

    // Once the deadline passes, the record is delivered exactly once.
    assert!(wait_until(Duration::from_secs(3), || log.count() == 1));
    assert!(started.elapsed() >= Duration::from_millis(250));
    container.stop().unwrap();

    assert_eq!(log.values(), vec!["later"]);
    assert_eq!(consumer.committed_offset(&tp), Some(1));
}

#[test]
fn test_container_routes_exhausted_records_through_the_recoverer() {
    init_tracing();
    let resolver = Arc::new(DestinationTopicResolver::new());
    resolver.register("orders", &exponential_config());
    let producer = MockProducer::new();
    let publisher = Arc::new(publisher_over(producer.clone(), resolver));

    let consumer = MockConsumer::new("g1").with_reset_policy(OffsetResetPolicy::Earliest);
    let tp = TopicPartition::new("orders", 0);
    consumer.schedule_assignment(vec![tp.clone()]);
    consumer.produce(&tp, None, Some(Bytes::from_static(b"X")), vec![]);

    let log = DeliveryLog::new();
    let log_clone = log.clone();
    let dispatcher = conveyor::container::MessageDispatcher::record_fn(
        move |record: &ConsumerRecord, _ctx: &mut conveyor::container::ListenerContext<'_>| {
            log_clone.record(record);
            Err::<(), ListenerError>(ListenerError::new("IllegalStateException", "always fails"))
        },
    );
    let container = MessageListenerContainer::builder(
        Arc::new(MockConsumerFactory::single(consumer.clone())),
        short_properties(TopicSelection::Names(vec!["orders".to_string()]), "g1"),
        dispatcher,
    )
    .error_handler(
        DefaultErrorHandler::new()
            .with_max_attempts(1)
            .with_recoverer(publisher as Arc<dyn RecordRecoverer>),
    )
    .build();

    container.start().unwrap();
    // One local delivery, then the record moves to the first retry topic
    // and its offset commits.
    assert!(wait_until(Duration::from_secs(3), || {
        consumer.committed_offset(&tp) == Some(1)
    }));
    container.stop().unwrap();

    assert_eq!(log.count(), 1);
    let sent = producer.sent_records();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "orders-retry-1000");
    let hopped = as_consumed(&sent[0], 0);
    assert_eq!(headers::attempts(&hopped), 1);
}

#[test]
fn test_no_dlt_strategy_drops_after_the_last_retry() {
    init_tracing();
    let config = RetryTopicConfiguration::builder()
        .max_attempts(1)
        .fixed_backoff(Duration::from_millis(1000))
        .dlt_strategy(DltStrategy::NoDlt)
        .build();
    let resolver = Arc::new(DestinationTopicResolver::new());
    let chain = resolver.register("orders", &config);
    assert!(chain.last().unwrap().is_no_ops());

    let producer = MockProducer::new();
    let publisher = publisher_over(producer.clone(), resolver);

    // A record that already consumed its retry budget.
    let base = ConsumerRecord::new("orders", 0, 0, None, Some(Bytes::from_static(b"X")));
    let error = ListenerError::new("AnyError", "still failing");
    let exhausted = ConsumerRecord::new(
        "orders-retry-1000",
        0,
        0,
        None,
        Some(Bytes::from_static(b"X")),
    )
    .with_headers(headers::next_hop_headers(&base, &error, 1, None));

    let destination = publisher.route(&exhausted, &error).unwrap();
    assert!(destination.is_none());
    assert!(producer.sent_records().is_empty());
}

#[test]
fn test_always_retry_on_error_loops_a_failed_dlt_publish_back() {
    init_tracing();
    let config = RetryTopicConfiguration::builder()
        .max_attempts(1)
        .fixed_backoff(Duration::from_millis(1000))
        .dlt_strategy(DltStrategy::AlwaysRetryOnError)
        .build();
    let resolver = Arc::new(DestinationTopicResolver::new());
    resolver.register("orders", &config);

    let producer = MockProducer::new();
    producer.fail_sends(1);
    let publisher = publisher_over(producer.clone(), resolver);

    let base = ConsumerRecord::new("orders", 0, 0, None, Some(Bytes::from_static(b"X")));
    let error = ListenerError::new("AnyError", "still failing");
    let exhausted = ConsumerRecord::new(
        "orders-retry-1000",
        0,
        0,
        None,
        Some(Bytes::from_static(b"X")),
    )
    .with_headers(headers::next_hop_headers(&base, &error, 2, None));

    let destination = publisher
        .route(&exhausted, &error)
        .unwrap()
        .expect("looped back to retry");
    assert_eq!(destination.name(), "orders-retry-1000");

    let sent = producer.sent_records();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "orders-retry-1000");
}

#[test]
fn test_fail_on_error_propagates_a_failed_dlt_publish() {
    init_tracing();
    let config = RetryTopicConfiguration::builder()
        .max_attempts(1)
        .fixed_backoff(Duration::from_millis(1000))
        .dlt_strategy(DltStrategy::FailOnError)
        .build();
    let resolver = Arc::new(DestinationTopicResolver::new());
    resolver.register("orders", &config);

    let producer = MockProducer::new();
    producer.fail_sends(1);
    let publisher = publisher_over(producer, resolver);

    let base = ConsumerRecord::new("orders", 0, 0, None, Some(Bytes::from_static(b"X")));
    let error = ListenerError::new("AnyError", "still failing");
    let exhausted = ConsumerRecord::new(
        "orders-retry-1000",
        0,
        0,
        None,
        Some(Bytes::from_static(b"X")),
    )
    .with_headers(headers::next_hop_headers(&base, &error, 2, None));

    let result = publisher.route(&exhausted, &error);
    assert!(matches!(result, Err(ConveyorError::DeadLetterPublish(_))));
}
