#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Conveyor
//!
//! Conveyor is a managed message-listener runtime for Kafka consumers. It
//! owns the poll loop so application code doesn't have to: records are
//! polled, dispatched to user listeners, and their offsets committed under
//! a configurable acknowledgment policy, with transactions, rebalancing,
//! error classification, and a non-blocking retry-topic pipeline handled by
//! the containers.
//!
//! ## What Conveyor is not
//!
//! Conveyor does not speak the Kafka wire protocol. Group membership, fetch
//! I/O, and framing live behind the injected [`client::Consumer`] and
//! [`client::Producer`] traits, implemented over a lower-level client
//! library. Payload conversion, annotation discovery, and topic
//! provisioning are likewise external collaborators.
//!
//! ## Quick start
//!
//! ```no_run
//! use conveyor::config::ContainerProperties;
//! use conveyor::container::{MessageDispatcher, MessageListenerContainer};
//! use conveyor::error::ListenerError;
//! use std::sync::Arc;
//!
//! # fn consumer_factory() -> Arc<dyn conveyor::client::ConsumerFactory> { unimplemented!() }
//! fn main() -> conveyor::Result<()> {
//!     let properties = ContainerProperties::for_topics(&["orders"], "billing");
//!     let dispatcher = MessageDispatcher::record_fn(
//!         |record: &conveyor::client::ConsumerRecord, _ctx: &mut conveyor::container::ListenerContext<'_>| {
//!             println!("got {:?}", record.value);
//!             Ok::<(), ListenerError>(())
//!         },
//!     );
//!     let container =
//!         MessageListenerContainer::builder(consumer_factory(), properties, dispatcher).build();
//!     container.start()?;
//!     // ... application runs ...
//!     container.stop()
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`client`]: injected consumer/producer traits and the record model
//! - [`config`]: [`config::ContainerProperties`] and the ack-mode policy
//! - [`container`]: the single-threaded poll loop and its concurrent façade
//! - [`handler`]: error classification, retry budgets, recovery
//! - [`producer`]: pooled transactional producer factory with suffix
//!   allocation
//! - [`retry`]: retry-topic chains, delayed redelivery, dead-lettering
//! - [`registry`]: named-container lifecycle bound to endpoint descriptors
//! - [`events`]: structured lifecycle events
//! - [`testing`]: scripted in-memory mocks for container tests

pub mod client;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod handler;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod testing;

pub use client::{
    CommitCallback, Consumer, ConsumerFactory, ConsumerGroupMetadata, ConsumerRecord,
    ConsumerWaker, Header, OffsetAndMetadata, OffsetMap, OffsetResetPolicy, Producer,
    ProducerRecord, RawProducerFactory, RecordBatch, RecordMetadata, TopicPartition,
    TopicSelection,
};
pub use config::{
    AckMode, AssignmentCommitOption, ContainerProperties, ContainerPropertiesBuilder,
    EndpointDescriptor,
};
pub use container::{
    Acknowledgment, ConcurrentListenerContainer, ContainerHandle, ContainerRebalanceListener,
    ContainerState, ListenerCapabilities, ListenerContext, MessageDispatcher,
    MessageListenerContainer, RecordInterceptor, SeekHandle, SeekRequest,
};
pub use error::{ConveyorError, ListenerError, Result};
pub use events::{ContainerEvent, EventKind, EventPublisher, LoggingEventPublisher};
pub use handler::{
    BackOffPolicy, BinaryErrorClassifier, Decision, DefaultAfterRollbackProcessor,
    DefaultErrorHandler, ErrorHandler, FailedRecordTracker, RecordRecoverer,
};
pub use producer::{PooledProducer, PooledProducerFactory};
pub use registry::{ContainerFactory, ContainerRegistry, DefaultContainerFactory, LoginInitializer};
pub use retry::{
    DeadLetterPublisher, DestinationKind, DestinationTopic, DestinationTopicResolver,
    DltStrategy, RetryTopicConfiguration, SuffixStrategy,
};
