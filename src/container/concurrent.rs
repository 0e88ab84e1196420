//! Concurrent listener container
//!
//! A façade over N independent single-threaded containers sharing one
//! configuration and consumer factory. Each child owns its own consumer
//! and thread; the group coordinator (or an explicit partition split)
//! decides the actual distribution.

use crate::client::{ConsumerFactory, TopicPartition, TopicSelection};
use crate::config::ContainerProperties;
use crate::container::listener::MessageDispatcher;
use crate::container::single::MessageListenerContainer;
use crate::container::ContainerState;
use crate::error::Result;
use crate::events::{EventPublisher, LoggingEventPublisher};
use crate::handler::{DefaultErrorHandler, ErrorHandler};
use crate::producer::PooledProducerFactory;
use std::sync::Arc;
use tracing::{info, warn};

/// Supplies one dispatcher per child container
pub type DispatcherProvider = Arc<dyn Fn() -> MessageDispatcher + Send + Sync>;

/// Supplies one error handler per child container
pub type ErrorHandlerProvider = Arc<dyn Fn() -> Box<dyn ErrorHandler> + Send + Sync>;

/// Supervises N single-threaded children named `<id>-0 … <id>-(N-1)`
pub struct ConcurrentListenerContainer {
    id: String,
    children: Vec<MessageListenerContainer>,
}

impl ConcurrentListenerContainer {
    /// Start building a concurrent container
    pub fn builder(
        consumer_factory: Arc<dyn ConsumerFactory>,
        properties: ContainerProperties,
        dispatcher_provider: DispatcherProvider,
    ) -> ConcurrentContainerBuilder {
        ConcurrentContainerBuilder::new(consumer_factory, properties, dispatcher_provider)
    }

    /// Container id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The effective number of children
    pub fn concurrency(&self) -> usize {
        self.children.len()
    }

    /// The supervised children, in index order
    pub fn children(&self) -> &[MessageListenerContainer] {
        &self.children
    }

    /// Start every child. If any child fails to start, the already
    /// started children are stopped and the error is returned.
    pub fn start(&self) -> Result<()> {
        info!(container = %self.id, children = self.children.len(), "Starting concurrent container");
        for (index, child) in self.children.iter().enumerate() {
            if let Err(e) = child.start() {
                warn!(container = %self.id, child = index, error = %e, "Child failed to start");
                for started in &self.children[..index] {
                    let _ = started.stop();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every child, waiting for each
    pub fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for child in &self.children {
            if let Err(e) = child.stop() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether any child is running
    pub fn is_running(&self) -> bool {
        self.children.iter().any(|c| c.is_running())
    }

    /// Aggregate state: running when any child runs
    pub fn state(&self) -> ContainerState {
        if self
            .children
            .iter()
            .any(|c| c.state() == ContainerState::Running)
        {
            ContainerState::Running
        } else if self.is_running() {
            ContainerState::Starting
        } else {
            ContainerState::Stopped
        }
    }

    /// Pause every child
    pub fn pause(&self) {
        for child in &self.children {
            child.pause();
        }
    }

    /// Resume every child
    pub fn resume(&self) {
        for child in &self.children {
            child.resume();
        }
    }

    /// Record the pause request on every child; whichever child owns the
    /// partition (now or after a rebalance) honors it
    pub fn pause_partition(&self, tp: TopicPartition) {
        for child in &self.children {
            child.pause_partition(tp.clone());
        }
    }

    /// Clear the partition pause request on every child
    pub fn resume_partition(&self, tp: TopicPartition) {
        for child in &self.children {
            child.resume_partition(tp.clone());
        }
    }

    /// True iff every child is paused
    pub fn is_container_paused(&self) -> bool {
        !self.children.is_empty() && self.children.iter().all(|c| c.is_container_paused())
    }

    /// Union of the children's assignments
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> = self
            .children
            .iter()
            .flat_map(|c| c.assigned_partitions())
            .collect();
        partitions.sort();
        partitions.dedup();
        partitions
    }
}

/// Builder for [`ConcurrentListenerContainer`]
pub struct ConcurrentContainerBuilder {
    id: String,
    concurrency: usize,
    consumer_factory: Arc<dyn ConsumerFactory>,
    properties: ContainerProperties,
    dispatcher_provider: DispatcherProvider,
    error_handler_provider: ErrorHandlerProvider,
    events: Arc<dyn EventPublisher>,
    tx_factory: Option<Arc<PooledProducerFactory>>,
}

impl ConcurrentContainerBuilder {
    fn new(
        consumer_factory: Arc<dyn ConsumerFactory>,
        properties: ContainerProperties,
        dispatcher_provider: DispatcherProvider,
    ) -> Self {
        Self {
            id: format!("conveyor-{}", properties.group_id),
            concurrency: 1,
            consumer_factory,
            properties,
            dispatcher_provider,
            error_handler_provider: Arc::new(|| Box::new(DefaultErrorHandler::new())),
            events: Arc::new(LoggingEventPublisher),
            tx_factory: None,
        }
    }

    /// Set the container id; children are named `<id>-<index>`
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Requested concurrency; clamped to the partition count when the
    /// assignment is explicit
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Supply one error handler per child
    pub fn error_handler_provider(mut self, provider: ErrorHandlerProvider) -> Self {
        self.error_handler_provider = provider;
        self
    }

    /// Set the event publisher shared by every child
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Process transactionally through the given producer factory
    pub fn transaction_factory(mut self, factory: Arc<PooledProducerFactory>) -> Self {
        self.tx_factory = Some(factory);
        self
    }

    /// Build the container and its children
    pub fn build(self) -> ConcurrentListenerContainer {
        let explicit = self.properties.explicit_partitions().map(|p| p.to_vec());
        let concurrency = match &explicit {
            // More children than partitions would only idle; clamp.
            Some(partitions) => self.concurrency.min(partitions.len().max(1)),
            None => self.concurrency,
        };

        let mut children = Vec::with_capacity(concurrency);
        for index in 0..concurrency {
            let mut child_properties = self.properties.clone();
            if let Some(partitions) = &explicit {
                let share: Vec<TopicPartition> = partitions
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| i % concurrency == index)
                    .map(|(_, tp)| tp.clone())
                    .collect();
                child_properties.selection = TopicSelection::Partitions(share);
            }

            let mut builder = MessageListenerContainer::builder(
                self.consumer_factory.clone(),
                child_properties,
                (self.dispatcher_provider)(),
            )
            .id(format!("{}-{}", self.id, index))
            .client_id_suffix(format!("-{index}"))
            .event_publisher(self.events.clone());
            builder = builder.boxed_error_handler((self.error_handler_provider)());
            if let Some(factory) = &self.tx_factory {
                builder = builder.transaction_factory(factory.clone());
            }
            children.push(builder.build());
        }

        ConcurrentListenerContainer {
            id: self.id,
            children,
        }
    }
}
