//! Container registry
//!
//! Binds externally supplied endpoint descriptors to containers and manages
//! their lifecycle by name. The registry never discovers endpoints itself;
//! a registrar hands it fully-formed [`EndpointDescriptor`]s.

use crate::client::ConsumerFactory;
use crate::config::{ContainerProperties, EndpointDescriptor};
use crate::container::concurrent::{
    ConcurrentListenerContainer, DispatcherProvider, ErrorHandlerProvider,
};
use crate::error::{ConveyorError, Result};
use crate::events::{EventPublisher, LoggingEventPublisher};
use crate::handler::DefaultErrorHandler;
use crate::producer::PooledProducerFactory;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Process-global login hook (JAAS-style), installed once before the first
/// container starts and restored when the registry shuts down
pub trait LoginInitializer: Send + Sync {
    /// Install the process-global login configuration
    fn install(&self) -> Result<()>;

    /// Restore the previous configuration
    fn restore(&self);
}

/// Builds a concurrent container from an endpoint descriptor
pub trait ContainerFactory: Send + Sync {
    /// Create (but do not start) the container for an endpoint
    fn create_container(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<ConcurrentListenerContainer>;
}

/// Default factory: a properties template specialized per endpoint
pub struct DefaultContainerFactory {
    consumer_factory: Arc<dyn ConsumerFactory>,
    properties_template: ContainerProperties,
    dispatcher_provider: DispatcherProvider,
    error_handler_provider: ErrorHandlerProvider,
    events: Arc<dyn EventPublisher>,
    tx_factory: Option<Arc<PooledProducerFactory>>,
}

impl DefaultContainerFactory {
    /// Create a factory from a template; each endpoint overrides the
    /// template's selection, group id, and client id prefix
    pub fn new(
        consumer_factory: Arc<dyn ConsumerFactory>,
        properties_template: ContainerProperties,
        dispatcher_provider: DispatcherProvider,
    ) -> Self {
        Self {
            consumer_factory,
            properties_template,
            dispatcher_provider,
            error_handler_provider: Arc::new(|| Box::new(DefaultErrorHandler::new())),
            events: Arc::new(LoggingEventPublisher),
            tx_factory: None,
        }
    }

    /// Supply one error handler per child container
    pub fn with_error_handler_provider(mut self, provider: ErrorHandlerProvider) -> Self {
        self.error_handler_provider = provider;
        self
    }

    /// Set the event publisher shared by every container
    pub fn with_event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Process transactionally through the given producer factory
    pub fn with_transaction_factory(mut self, factory: Arc<PooledProducerFactory>) -> Self {
        self.tx_factory = Some(factory);
        self
    }
}

impl ContainerFactory for DefaultContainerFactory {
    fn create_container(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<ConcurrentListenerContainer> {
        let mut properties = self.properties_template.clone();
        properties.selection = endpoint.selection.clone();
        properties.group_id = endpoint.group_id.clone();
        if let Some(prefix) = &endpoint.client_id_prefix {
            properties.client_id_prefix = prefix.clone();
        } else {
            properties.client_id_prefix = endpoint.id.clone();
        }

        let mut builder = ConcurrentListenerContainer::builder(
            self.consumer_factory.clone(),
            properties,
            self.dispatcher_provider.clone(),
        )
        .id(endpoint.id.clone())
        .concurrency(endpoint.concurrency.max(1))
        .error_handler_provider(self.error_handler_provider.clone())
        .event_publisher(self.events.clone());
        if let Some(factory) = &self.tx_factory {
            builder = builder.transaction_factory(factory.clone());
        }
        Ok(builder.build())
    }
}

/// Starts, stops, and pauses named containers
pub struct ContainerRegistry {
    containers: DashMap<String, Arc<ConcurrentListenerContainer>>,
    login: Mutex<Option<Box<dyn LoginInitializer>>>,
    login_installed: AtomicBool,
    running: AtomicBool,
}

impl ContainerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            login: Mutex::new(None),
            login_installed: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Install a process-global login hook invoked before the first start
    pub fn with_login_initializer(self, login: Box<dyn LoginInitializer>) -> Self {
        *self.login.lock() = Some(login);
        self
    }

    /// Bind an endpoint to a container built by the factory. Fails when a
    /// container with the endpoint's id already exists.
    pub fn register(
        &self,
        endpoint: &EndpointDescriptor,
        factory: &dyn ContainerFactory,
    ) -> Result<Arc<ConcurrentListenerContainer>> {
        if self.containers.contains_key(&endpoint.id) {
            return Err(ConveyorError::Config(format!(
                "container already registered: {}",
                endpoint.id
            )));
        }
        let container = Arc::new(factory.create_container(endpoint)?);
        self.containers
            .insert(endpoint.id.clone(), container.clone());
        info!(container = %endpoint.id, "Container registered");
        Ok(container)
    }

    /// The container with the given id, if registered
    pub fn get_container(&self, id: &str) -> Option<Arc<ConcurrentListenerContainer>> {
        self.containers.get(id).map(|entry| entry.value().clone())
    }

    /// Ids of every registered container, sorted
    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .containers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Containers whose id matches the predicate
    pub fn containers_matching(
        &self,
        predicate: impl Fn(&str) -> bool,
    ) -> Vec<Arc<ConcurrentListenerContainer>> {
        self.containers
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every registered container
    pub fn all_containers(&self) -> Vec<Arc<ConcurrentListenerContainer>> {
        self.containers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn ensure_login(&self) -> Result<()> {
        if self.login_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(login) = self.login.lock().as_ref() {
            login.install()?;
        }
        Ok(())
    }

    /// Start one container by id
    pub fn start(&self, id: &str) -> Result<()> {
        self.ensure_login()?;
        self.get_container(id)
            .ok_or_else(|| ConveyorError::ContainerNotFound(id.to_string()))?
            .start()
    }

    /// Stop one container by id
    pub fn stop(&self, id: &str) -> Result<()> {
        self.get_container(id)
            .ok_or_else(|| ConveyorError::ContainerNotFound(id.to_string()))?
            .stop()
    }

    /// Pause one container by id
    pub fn pause(&self, id: &str) -> Result<()> {
        self.get_container(id)
            .ok_or_else(|| ConveyorError::ContainerNotFound(id.to_string()))?
            .pause();
        Ok(())
    }

    /// Resume one container by id
    pub fn resume(&self, id: &str) -> Result<()> {
        self.get_container(id)
            .ok_or_else(|| ConveyorError::ContainerNotFound(id.to_string()))?
            .resume();
        Ok(())
    }

    /// Start every registered container
    pub fn start_all(&self) -> Result<()> {
        self.ensure_login()?;
        for id in self.container_ids() {
            if let Err(e) = self.start(&id) {
                warn!(container = %id, error = %e, "Container failed to start");
                return Err(e);
            }
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop every registered container and restore the login hook
    pub fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for id in self.container_ids() {
            if let Err(e) = self.stop(&id) {
                warn!(container = %id, error = %e, "Container failed to stop");
                first_error.get_or_insert(e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        if self.login_installed.swap(false, Ordering::SeqCst) {
            if let Some(login) = self.login.lock().as_ref() {
                login.restore();
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether `start_all` has run without a later `stop_all`
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
