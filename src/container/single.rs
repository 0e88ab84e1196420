//! Single-threaded listener container
//!
//! Owns exactly one consumer and one poll thread. Every consumer method is
//! invoked on that thread; external requests arrive through the command
//! queue and are drained at the top of each iteration. Transactions wrap
//! each dispatch unit: one record for record listeners, one (sub-)batch for
//! batch listeners.

use crate::client::{
    Consumer, ConsumerFactory, ConsumerGroupMetadata, ConsumerRecord, OffsetAndMetadata,
    OffsetMap, Producer, RecordBatch, RebalanceHandler, TopicPartition, TopicSelection,
};
use crate::config::{AckMode, AssignmentCommitOption, ContainerProperties};
use crate::container::ack::{AckMessage, AckSignal, Acknowledgment};
use crate::container::listener::{
    BatchInterceptor, DispatchVariant, ListenerContext, MessageDispatcher, RecordInterceptor,
};
use crate::container::offset_tracker::OffsetTracker;
use crate::container::rebalance::{ContainerRebalanceListener, NoopRebalanceListener};
use crate::container::seek::{apply_seek, SeekHandle, SeekRequest};
use crate::container::{Command, ContainerHandle, ContainerShared, ContainerState};
use crate::error::{ConveyorError, ListenerError, Result};
use crate::events::{ContainerEvent, EventKind, EventPublisher, LoggingEventPublisher};
use crate::handler::{
    AfterRollbackProcessor, Decision, DefaultAfterRollbackProcessor, DefaultErrorHandler,
    ErrorHandler,
};
use crate::producer::PooledProducerFactory;
use crate::retry::headers;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Sleep before re-polling after a transient broker error
const TRANSIENT_RETRY_SLEEP: Duration = Duration::from_millis(100);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct RunningParts {
    worker: JoinHandle<()>,
    monitor: JoinHandle<()>,
    monitor_stop: Sender<()>,
    done_rx: Receiver<Option<String>>,
}

/// A managed listener container over one consumer and one poll thread
pub struct MessageListenerContainer {
    shared: Arc<ContainerShared>,
    properties: Arc<ContainerProperties>,
    events: Arc<dyn EventPublisher>,
    consumer_factory: Arc<dyn ConsumerFactory>,
    dispatcher: Arc<Mutex<MessageDispatcher>>,
    error_handler: Arc<Mutex<Box<dyn ErrorHandler>>>,
    rebalance_listener: Arc<Mutex<Box<dyn ContainerRebalanceListener>>>,
    after_rollback: Arc<Mutex<Box<dyn AfterRollbackProcessor>>>,
    interceptors: Arc<Vec<Box<dyn RecordInterceptor>>>,
    batch_interceptors: Arc<Vec<Box<dyn BatchInterceptor>>>,
    tx_factory: Option<Arc<PooledProducerFactory>>,
    client_id_suffix: String,
    command_tx: Sender<Command>,
    command_rx: Receiver<Command>,
    seek_handle: SeekHandle,
    seek_rx: Receiver<SeekRequest>,
    running: Mutex<Option<RunningParts>>,
    stop_callbacks: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl MessageListenerContainer {
    /// Start building a container
    pub fn builder(
        consumer_factory: Arc<dyn ConsumerFactory>,
        properties: ContainerProperties,
        dispatcher: MessageDispatcher,
    ) -> ListenerContainerBuilder {
        ListenerContainerBuilder::new(consumer_factory, properties, dispatcher)
    }

    /// Container id
    pub fn id(&self) -> &str {
        self.shared.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContainerState {
        self.shared.state()
    }

    /// Whether the poll loop is active
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ContainerState::Starting | ContainerState::Running
        )
    }

    /// Indirection handle for collaborators
    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle::new(self.shared.clone(), self.command_tx.clone())
    }

    /// Deferred-seek handle usable from any thread
    pub fn seek_handle(&self) -> SeekHandle {
        self.seek_handle.clone()
    }

    /// Partitions currently assigned to the consumer
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.shared.assigned_partitions()
    }

    /// True iff pause was requested and every assigned partition is
    /// effectively paused at the client
    pub fn is_container_paused(&self) -> bool {
        self.shared.is_container_paused()
    }

    /// Whether a container-wide pause has been requested
    pub fn is_pause_requested(&self) -> bool {
        self.shared.is_pause_requested()
    }

    /// Request a container-wide pause; takes effect on the poll thread
    pub fn pause(&self) {
        self.shared.set_pause_requested(true);
        let _ = self.command_tx.send(Command::Pause);
    }

    /// Request a container-wide resume
    pub fn resume(&self) {
        self.shared.set_pause_requested(false);
        let _ = self.command_tx.send(Command::Resume);
    }

    /// Request a pause for one partition. Recorded even when the partition
    /// is not currently assigned; it pauses immediately on reassignment.
    pub fn pause_partition(&self, tp: TopicPartition) {
        self.shared.request_partition_pause(tp.clone());
        let _ = self.command_tx.send(Command::PausePartition(tp));
    }

    /// Request a resume for one partition
    pub fn resume_partition(&self, tp: TopicPartition) {
        self.shared.clear_partition_pause(&tp);
        let _ = self.command_tx.send(Command::ResumePartition(tp));
    }

    /// Schedule a callback to run after the container has fully stopped
    pub fn add_stop_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.stop_callbacks.lock().push(Box::new(callback));
    }

    /// Start the container. Idempotent: starting a running container is a
    /// no-op. Blocks until the consumer has been created and subscribed.
    pub fn start(&self) -> Result<()> {
        if !self
            .shared
            .transition(ContainerState::Stopped, ContainerState::Starting)
        {
            return Ok(());
        }
        self.publish(EventKind::ConsumerStarting);

        let (startup_tx, startup_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<Option<String>>(1);

        let setup = WorkerSetup {
            shared: self.shared.clone(),
            properties: self.properties.clone(),
            events: self.events.clone(),
            consumer_factory: self.consumer_factory.clone(),
            dispatcher: self.dispatcher.clone(),
            error_handler: self.error_handler.clone(),
            rebalance_listener: self.rebalance_listener.clone(),
            after_rollback: self.after_rollback.clone(),
            interceptors: self.interceptors.clone(),
            batch_interceptors: self.batch_interceptors.clone(),
            tx_factory: self.tx_factory.clone(),
            client_id_suffix: self.client_id_suffix.clone(),
            commands: self.command_rx.clone(),
            command_tx: self.command_tx.clone(),
            seeks: self.seek_rx.clone(),
            seek_handle: self.seek_handle.clone(),
            stop_callbacks: self.stop_callbacks.clone(),
        };

        let thread_name = format!("{}-consumer", self.shared.id());
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || setup.run(startup_tx, done_tx))
            .map_err(|e| ConveyorError::ConsumerCreation(e.to_string()))?;

        match startup_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(ConveyorError::ConsumerCreation(
                    "consumer thread exited before startup".to_string(),
                ));
            }
        }

        let (monitor_stop, monitor_stop_rx) = crossbeam_channel::bounded::<()>(1);
        let monitor = self.spawn_monitor(monitor_stop_rx);

        *self.running.lock() = Some(RunningParts {
            worker,
            monitor,
            monitor_stop,
            done_rx,
        });
        Ok(())
    }

    fn spawn_monitor(&self, stop_rx: Receiver<()>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let events = self.events.clone();
        let interval = self.properties.monitor_interval;
        let threshold = self
            .properties
            .poll_timeout
            .mul_f64(self.properties.no_poll_threshold);
        std::thread::Builder::new()
            .name(format!("{}-monitor", self.shared.id()))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if shared.state() == ContainerState::Running
                            && shared.since_last_poll() > threshold
                        {
                            events.publish(ContainerEvent::now(
                                shared.id(),
                                EventKind::NonResponsive {
                                    since_last_poll_ms: shared.since_last_poll().as_millis()
                                        as u64,
                                },
                            ));
                        }
                    }
                }
            })
            .unwrap_or_else(|_| std::thread::spawn(|| {}))
    }

    /// Stop the container, waiting up to the configured shutdown timeout.
    /// Stopping a stopped container is a no-op.
    pub fn stop(&self) -> Result<()> {
        self.stop_with_timeout(self.properties.shutdown_timeout)
    }

    /// Stop the container, waiting up to `timeout` for the poll loop
    pub fn stop_with_timeout(&self, timeout: Duration) -> Result<()> {
        let was_running = self
            .shared
            .transition(ContainerState::Running, ContainerState::Stopping)
            || self
                .shared
                .transition(ContainerState::Starting, ContainerState::Stopping);
        if was_running {
            let _ = self.command_tx.send(Command::Stop {
                immediate: self.properties.stop_immediate,
            });
            self.shared.wakeup();
        }

        // A container that stopped itself (fatal error) still has threads
        // to reap here.
        if let Some(parts) = self.running.lock().take() {
            if parts.done_rx.recv_timeout(timeout).is_err() {
                warn!(container = %self.shared.id(), "Poll loop did not stop within timeout");
            }
            let _ = parts.worker.join();
            let _ = parts.monitor_stop.send(());
            let _ = parts.monitor.join();
        }
        Ok(())
    }

    fn publish(&self, kind: EventKind) {
        self.events
            .publish(ContainerEvent::now(self.shared.id(), kind));
    }
}

/// Builder for [`MessageListenerContainer`]
pub struct ListenerContainerBuilder {
    id: String,
    client_id_suffix: String,
    consumer_factory: Arc<dyn ConsumerFactory>,
    properties: ContainerProperties,
    dispatcher: MessageDispatcher,
    events: Arc<dyn EventPublisher>,
    error_handler: Box<dyn ErrorHandler>,
    rebalance_listener: Box<dyn ContainerRebalanceListener>,
    after_rollback: Box<dyn AfterRollbackProcessor>,
    interceptors: Vec<Box<dyn RecordInterceptor>>,
    batch_interceptors: Vec<Box<dyn BatchInterceptor>>,
    tx_factory: Option<Arc<PooledProducerFactory>>,
}

impl ListenerContainerBuilder {
    fn new(
        consumer_factory: Arc<dyn ConsumerFactory>,
        properties: ContainerProperties,
        dispatcher: MessageDispatcher,
    ) -> Self {
        Self {
            id: format!("conveyor-{}", properties.group_id),
            client_id_suffix: String::new(),
            consumer_factory,
            properties,
            dispatcher,
            events: Arc::new(LoggingEventPublisher),
            error_handler: Box::new(DefaultErrorHandler::new()),
            rebalance_listener: Box::new(NoopRebalanceListener),
            after_rollback: Box::new(DefaultAfterRollbackProcessor::new()),
            interceptors: Vec::new(),
            batch_interceptors: Vec::new(),
            tx_factory: None,
        }
    }

    /// Set the container id
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the client-id suffix appended by the consumer factory
    pub fn client_id_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.client_id_suffix = suffix.into();
        self
    }

    /// Set the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Set the error handler
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Box::new(handler);
        self
    }

    /// Set an already-boxed error handler
    pub fn boxed_error_handler(mut self, handler: Box<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Set the user rebalance listener
    pub fn rebalance_listener(
        mut self,
        listener: impl ContainerRebalanceListener + 'static,
    ) -> Self {
        self.rebalance_listener = Box::new(listener);
        self
    }

    /// Set the after-rollback processor used with transactions
    pub fn after_rollback(mut self, processor: impl AfterRollbackProcessor + 'static) -> Self {
        self.after_rollback = Box::new(processor);
        self
    }

    /// Add a record interceptor; interceptors run in registration order
    pub fn record_interceptor(mut self, interceptor: impl RecordInterceptor + 'static) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    /// Add a batch interceptor; interceptors run in registration order
    pub fn batch_interceptor(mut self, interceptor: impl BatchInterceptor + 'static) -> Self {
        self.batch_interceptors.push(Box::new(interceptor));
        self
    }

    /// Process transactionally through the given producer factory
    pub fn transaction_factory(mut self, factory: Arc<PooledProducerFactory>) -> Self {
        self.tx_factory = Some(factory);
        self
    }

    /// Build the container
    pub fn build(self) -> MessageListenerContainer {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (seek_handle, seek_rx) = SeekHandle::channel();
        MessageListenerContainer {
            shared: Arc::new(ContainerShared::new(self.id)),
            properties: Arc::new(self.properties),
            events: self.events,
            consumer_factory: self.consumer_factory,
            dispatcher: Arc::new(Mutex::new(self.dispatcher)),
            error_handler: Arc::new(Mutex::new(self.error_handler)),
            rebalance_listener: Arc::new(Mutex::new(self.rebalance_listener)),
            after_rollback: Arc::new(Mutex::new(self.after_rollback)),
            interceptors: Arc::new(self.interceptors),
            batch_interceptors: Arc::new(self.batch_interceptors),
            tx_factory: self.tx_factory,
            client_id_suffix: self.client_id_suffix,
            command_tx,
            command_rx,
            seek_handle,
            seek_rx,
            running: Mutex::new(None),
            stop_callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

struct WorkerSetup {
    shared: Arc<ContainerShared>,
    properties: Arc<ContainerProperties>,
    events: Arc<dyn EventPublisher>,
    consumer_factory: Arc<dyn ConsumerFactory>,
    dispatcher: Arc<Mutex<MessageDispatcher>>,
    error_handler: Arc<Mutex<Box<dyn ErrorHandler>>>,
    rebalance_listener: Arc<Mutex<Box<dyn ContainerRebalanceListener>>>,
    after_rollback: Arc<Mutex<Box<dyn AfterRollbackProcessor>>>,
    interceptors: Arc<Vec<Box<dyn RecordInterceptor>>>,
    batch_interceptors: Arc<Vec<Box<dyn BatchInterceptor>>>,
    tx_factory: Option<Arc<PooledProducerFactory>>,
    client_id_suffix: String,
    commands: Receiver<Command>,
    command_tx: Sender<Command>,
    seeks: Receiver<SeekRequest>,
    seek_handle: SeekHandle,
    stop_callbacks: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl WorkerSetup {
    fn run(self, startup_tx: Sender<Result<()>>, done_tx: Sender<Option<String>>) {
        let consumer = match self.open_consumer() {
            Ok(consumer) => consumer,
            Err(e) => {
                self.shared.set_state(ContainerState::Stopped);
                self.events.publish(ContainerEvent::now(
                    self.shared.id(),
                    EventKind::ConsumerFailedToStart {
                        reason: e.to_string(),
                    },
                ));
                let _ = startup_tx.send(Err(e));
                let _ = done_tx.send(None);
                return;
            }
        };

        self.shared.set_waker(Some(consumer.waker()));
        self.shared.set_state(ContainerState::Running);
        self.events.publish(ContainerEvent::now(
            self.shared.id(),
            EventKind::ConsumerStarted,
        ));
        let _ = startup_tx.send(Ok(()));

        let (ack_tx, acks) = crossbeam_channel::unbounded();
        let handle = ContainerHandle::new(self.shared.clone(), self.command_tx.clone());
        let mut poll_loop = PollLoop {
            consumer,
            state: LoopState {
                group_id: self.properties.group_id.clone(),
                tracker: OffsetTracker::new(
                    self.properties.ack_mode,
                    self.properties.async_acks,
                    self.properties.ack_count,
                    self.properties.ack_time,
                ),
                shared: self.shared.clone(),
                properties: self.properties.clone(),
                events: self.events.clone(),
                dispatcher: self.dispatcher.clone(),
                error_handler: self.error_handler.clone(),
                rebalance_listener: self.rebalance_listener.clone(),
                after_rollback: self.after_rollback.clone(),
                interceptors: self.interceptors.clone(),
                batch_interceptors: self.batch_interceptors.clone(),
                tx_factory: self.tx_factory.clone(),
                handle,
                commands: self.commands.clone(),
                ack_tx,
                acks,
                seeks: self.seeks.clone(),
                seek_handle: self.seek_handle.clone(),
                running: true,
                stop_immediate: false,
                fatal: None,
                remaining: None,
                retained_paused: HashSet::new(),
                retained_resume_at: None,
                first_assignment_seen: false,
                paused_applied: false,
                resume_at: HashMap::new(),
                group_metadata: None,
                last_receive: Instant::now(),
                any_data: false,
                last_idle_emit: None,
                partition_last_receive: HashMap::new(),
                partition_last_idle_emit: HashMap::new(),
            },
        };

        let cause = poll_loop.run();
        let _ = done_tx.send(cause);

        for callback in self.stop_callbacks.lock().drain(..) {
            callback();
        }
    }

    fn open_consumer(&self) -> Result<Box<dyn Consumer>> {
        let consumer = self.consumer_factory.create(
            &self.properties.group_id,
            &self.properties.client_id_prefix,
            &self.client_id_suffix,
            &self.properties.consumer_overrides,
        )?;
        match &self.properties.selection {
            TopicSelection::Partitions(partitions) => consumer.assign(partitions)?,
            selection => consumer.subscribe(selection)?,
        }
        info!(
            container = %self.shared.id(),
            group = %self.properties.group_id,
            "Consumer created and subscribed"
        );
        Ok(consumer)
    }
}

enum DispatchOutcome {
    Continue,
    AbandonBatch,
}

struct LoopState {
    group_id: String,
    tracker: OffsetTracker,
    shared: Arc<ContainerShared>,
    properties: Arc<ContainerProperties>,
    events: Arc<dyn EventPublisher>,
    dispatcher: Arc<Mutex<MessageDispatcher>>,
    error_handler: Arc<Mutex<Box<dyn ErrorHandler>>>,
    rebalance_listener: Arc<Mutex<Box<dyn ContainerRebalanceListener>>>,
    after_rollback: Arc<Mutex<Box<dyn AfterRollbackProcessor>>>,
    interceptors: Arc<Vec<Box<dyn RecordInterceptor>>>,
    batch_interceptors: Arc<Vec<Box<dyn BatchInterceptor>>>,
    tx_factory: Option<Arc<PooledProducerFactory>>,
    handle: ContainerHandle,
    commands: Receiver<Command>,
    ack_tx: Sender<AckMessage>,
    acks: Receiver<AckMessage>,
    seeks: Receiver<SeekRequest>,
    seek_handle: SeekHandle,
    running: bool,
    stop_immediate: bool,
    fatal: Option<String>,
    remaining: Option<Vec<ConsumerRecord>>,
    retained_paused: HashSet<TopicPartition>,
    retained_resume_at: Option<Instant>,
    first_assignment_seen: bool,
    paused_applied: bool,
    resume_at: HashMap<TopicPartition, Instant>,
    group_metadata: Option<ConsumerGroupMetadata>,
    last_receive: Instant,
    any_data: bool,
    last_idle_emit: Option<Instant>,
    partition_last_receive: HashMap<TopicPartition, Instant>,
    partition_last_idle_emit: HashMap<TopicPartition, Instant>,
}

struct PollLoop {
    consumer: Box<dyn Consumer>,
    state: LoopState,
}

impl PollLoop {
    /// Run until stopped; returns the fatal cause, if any
    fn run(&mut self) -> Option<String> {
        // A stop issued before this run began belongs to a previous run.
        self.state.discard_stale_stops();

        // Explicit assignment never sees a rebalance callback; the
        // partition state is initialized here instead.
        if let TopicSelection::Partitions(partitions) =
            self.state.properties.selection.clone()
        {
            if let Err(e) = self.state.init_explicit_assignment(&*self.consumer, &partitions) {
                error!(container = %self.state.shared.id(), error = %e, "Assignment setup failed");
                self.state.fatal = Some(e.to_string());
                self.state.running = false;
            }
        }

        while self.state.running {
            if let Err(e) = self.iterate() {
                error!(container = %self.state.shared.id(), error = %e, "Poll loop failed");
                self.state.fatal = Some(e.to_string());
                break;
            }
        }
        self.shutdown();
        self.state.fatal.take()
    }

    fn iterate(&mut self) -> Result<()> {
        self.state.drain_commands(&*self.consumer);
        if !self.state.running {
            return Ok(());
        }
        self.state.drain_seeks(&*self.consumer);
        self.state.apply_pause_state(&*self.consumer)?;
        self.state.resume_expired(&*self.consumer)?;

        let timeout = if self.state.shared.is_container_paused() {
            self.state.properties.poll_timeout_while_paused
        } else {
            self.state.properties.poll_timeout
        };

        let batch = match self.consumer.poll(timeout, &mut self.state) {
            Ok(batch) => batch,
            Err(e) => {
                self.state.shared.note_poll_return();
                return self.state.handle_poll_error(e);
            }
        };
        self.state.shared.note_poll_return();
        self.state.observe_batch(&batch);

        if self.state.tx_factory.is_some() {
            self.state.group_metadata = Some(self.consumer.group_metadata());
        }

        self.state.redeliver_retained(&*self.consumer)?;

        let drop_batch = self.state.stop_immediate && !self.state.running;
        if !batch.is_empty() && !drop_batch {
            self.state.dispatch_batch(&*self.consumer, batch)?;
        }

        self.state.drain_acks(&*self.consumer)?;
        self.state.apply_gap_transitions(&*self.consumer)?;
        self.state.commit_ready(&*self.consumer)?;
        self.state.emit_idle_events();
        Ok(())
    }

    fn shutdown(&mut self) {
        let state = &mut self.state;
        state.publish(EventKind::ConsumerStopping);

        if !state.stop_immediate {
            // One final drain so acked records are committed before close.
            let _ = state.drain_acks(&*self.consumer);
            let offsets = state.tracker.take_all_pending();
            if let Err(e) = state.commit(&*self.consumer, offsets) {
                warn!(container = %state.shared.id(), error = %e, "Final commit failed");
            }
        }

        if let Err(e) = self.consumer.close(state.properties.shutdown_timeout) {
            warn!(container = %state.shared.id(), error = %e, "Consumer close failed");
        }
        state.publish(EventKind::ConsumerStopped);

        state.shared.set_assigned(Vec::new());
        state.shared.set_waker(None);
        state.shared.set_state(ContainerState::Stopped);
        state.publish(EventKind::ContainerStopped {
            cause: state.fatal.clone(),
        });
        info!(container = %state.shared.id(), "Container stopped");
    }
}

impl LoopState {
    fn publish(&self, kind: EventKind) {
        self.events
            .publish(ContainerEvent::now(self.shared.id(), kind));
    }

    fn discard_stale_stops(&mut self) {
        let pending: Vec<Command> = self.commands.try_iter().collect();
        for command in pending {
            if !matches!(command, Command::Stop { .. }) {
                let _ = self.command_tx_requeue(command);
            }
        }
    }

    fn command_tx_requeue(&self, command: Command) -> Result<()> {
        // Requeue through the handle's sender so ordering is preserved
        // relative to commands arriving during this run.
        match command {
            Command::Pause => self.handle.pause(),
            Command::Resume => self.handle.resume(),
            Command::PausePartition(tp) => self.handle.pause_partition(tp),
            Command::ResumePartition(tp) => self.handle.resume_partition(tp),
            Command::Stop { .. } => {}
        }
        Ok(())
    }

    fn drain_commands(&mut self, consumer: &dyn Consumer) {
        let pending: Vec<Command> = self.commands.try_iter().collect();
        for command in pending {
            match command {
                Command::Pause => self.shared.set_pause_requested(true),
                Command::Resume => self.shared.set_pause_requested(false),
                Command::PausePartition(tp) => {
                    self.shared.request_partition_pause(tp.clone());
                    if self.is_assigned(&tp) {
                        if consumer.pause(std::slice::from_ref(&tp)).is_ok() {
                            self.shared.note_client_paused(tp.clone(), true);
                            self.publish(EventKind::PartitionPaused { partition: tp });
                        }
                    }
                }
                Command::ResumePartition(tp) => {
                    self.shared.clear_partition_pause(&tp);
                    let held = self.shared.is_pause_requested()
                        || self.resume_at.contains_key(&tp)
                        || self.retained_paused.contains(&tp);
                    if self.is_assigned(&tp) && !held {
                        if consumer.resume(std::slice::from_ref(&tp)).is_ok() {
                            self.shared.note_client_paused(tp.clone(), false);
                            self.publish(EventKind::PartitionResumed { partition: tp });
                        }
                    }
                }
                Command::Stop { immediate } => {
                    self.running = false;
                    self.stop_immediate = immediate;
                    self.shared.set_state(ContainerState::Stopping);
                }
            }
        }
    }

    fn drain_seeks(&mut self, consumer: &dyn Consumer) {
        let pending: Vec<SeekRequest> = self.seeks.try_iter().collect();
        for request in pending {
            if let SeekRequest::Absolute { tp, offset } = &request {
                self.tracker.on_seek(tp, *offset);
            }
            if let Err(e) = apply_seek(consumer, &request) {
                warn!(container = %self.shared.id(), error = %e, "Deferred seek failed");
            }
        }
    }

    fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.shared.assigned_partitions().contains(tp)
    }

    fn apply_pause_state(&mut self, consumer: &dyn Consumer) -> Result<()> {
        let requested = self.shared.is_pause_requested();
        if requested && !self.paused_applied {
            let assigned = consumer.assignment()?;
            consumer.pause(&assigned)?;
            for tp in &assigned {
                self.shared.note_client_paused(tp.clone(), true);
            }
            self.paused_applied = true;
            self.publish(EventKind::Paused);
        } else if !requested && self.paused_applied {
            let assigned = consumer.assignment()?;
            let resumable: Vec<TopicPartition> = assigned
                .into_iter()
                .filter(|tp| {
                    !self.shared.partition_pause_requested(tp)
                        && !self.resume_at.contains_key(tp)
                        && !self.retained_paused.contains(tp)
                })
                .collect();
            consumer.resume(&resumable)?;
            for tp in &resumable {
                self.shared.note_client_paused(tp.clone(), false);
            }
            self.paused_applied = false;
            self.publish(EventKind::Resumed);
        }
        Ok(())
    }

    fn resume_expired(&mut self, consumer: &dyn Consumer) -> Result<()> {
        let now = Instant::now();
        let due: Vec<TopicPartition> = self
            .resume_at
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(tp, _)| tp.clone())
            .collect();
        for tp in due {
            self.resume_at.remove(&tp);
            let held = self.shared.is_pause_requested()
                || self.shared.partition_pause_requested(&tp)
                || self.retained_paused.contains(&tp);
            if self.is_assigned(&tp) && !held {
                consumer.resume(std::slice::from_ref(&tp))?;
                self.shared.note_client_paused(tp.clone(), false);
                self.publish(EventKind::PartitionResumed { partition: tp });
            }
        }
        Ok(())
    }

    fn handle_poll_error(&mut self, error: ConveyorError) -> Result<()> {
        if error.is_wakeup() {
            return Ok(());
        }
        if error.is_transient() {
            debug!(container = %self.shared.id(), error = %error, "Transient poll error, retrying");
            std::thread::sleep(TRANSIENT_RETRY_SLEEP);
            return Ok(());
        }
        if error.is_auth() {
            return match self.properties.auth_retry_interval {
                Some(interval) => {
                    warn!(
                        container = %self.shared.id(),
                        error = %error,
                        retry_in_ms = interval.as_millis() as u64,
                        "Authentication failure, retrying"
                    );
                    std::thread::sleep(interval);
                    Ok(())
                }
                None => {
                    self.publish(EventKind::ConsumerFailedToStart {
                        reason: error.to_string(),
                    });
                    Err(error)
                }
            };
        }
        if let ConveyorError::Rebalance(reason) = &error {
            // Fatal to the current generation only; the consumer rejoins
            // on the next poll.
            warn!(container = %self.shared.id(), reason = %reason, "Rebalance callback failed");
            return Ok(());
        }
        Err(error)
    }

    fn observe_batch(&mut self, batch: &RecordBatch) {
        if batch.is_empty() {
            return;
        }
        let now = Instant::now();
        self.last_receive = now;
        self.any_data = true;
        self.last_idle_emit = None;
        for tp in batch.partitions() {
            self.partition_last_receive.insert(tp.clone(), now);
            self.partition_last_idle_emit.remove(&tp);
        }
    }

    fn emit_idle_events(&mut self) {
        let now = Instant::now();
        if let Some(interval) = self.properties.idle_event_interval {
            let threshold = if self.any_data {
                interval
            } else {
                interval.mul_f64(self.properties.idle_before_data_multiplier)
            };
            let idle_for = self.last_receive.elapsed();
            let due = self
                .last_idle_emit
                .map(|t| t.elapsed() >= interval)
                .unwrap_or(true);
            if idle_for >= threshold && due {
                self.publish(EventKind::Idle {
                    idle_for_ms: idle_for.as_millis() as u64,
                });
                self.last_idle_emit = Some(now);
            }
        }
        if let Some(interval) = self.properties.idle_partition_event_interval {
            for tp in self.shared.assigned_partitions() {
                let last = *self
                    .partition_last_receive
                    .entry(tp.clone())
                    .or_insert(now);
                let due = self
                    .partition_last_idle_emit
                    .get(&tp)
                    .map(|t| t.elapsed() >= interval)
                    .unwrap_or(true);
                if last.elapsed() >= interval && due {
                    self.publish(EventKind::IdlePartition {
                        partition: tp.clone(),
                        idle_for_ms: last.elapsed().as_millis() as u64,
                    });
                    self.partition_last_idle_emit.insert(tp, now);
                }
            }
        }
    }

    // ── dispatch ──

    fn dispatch_batch(&mut self, consumer: &dyn Consumer, batch: RecordBatch) -> Result<()> {
        let is_batch = self.dispatcher.lock().is_batch();
        if is_batch {
            self.dispatch_batch_listener(consumer, batch)
        } else {
            self.dispatch_records(consumer, batch.into_records())
        }
    }

    fn dispatch_records(
        &mut self,
        consumer: &dyn Consumer,
        records: Vec<ConsumerRecord>,
    ) -> Result<()> {
        let mut gated: HashSet<TopicPartition> = HashSet::new();
        for index in 0..records.len() {
            let record = records[index].clone();
            let tp = record.topic_partition();
            if gated.contains(&tp) {
                continue;
            }

            // A record published by the retry engine carries its own
            // delivery deadline; honor it before dispatching.
            if let Some(deadline) = headers::backoff_deadline(&record) {
                let now = now_ms();
                if deadline > now {
                    self.delay_partition(
                        consumer,
                        &tp,
                        record.offset,
                        Duration::from_millis((deadline - now) as u64),
                    )?;
                    gated.insert(tp);
                    continue;
                }
            }

            if self.properties.pause_immediate
                && self.shared.is_pause_requested()
                && !self.paused_applied
            {
                self.seek_back_over(consumer, &records[index..])?;
                return Ok(());
            }

            match self.dispatch_one(consumer, &record, &records[index + 1..])? {
                DispatchOutcome::Continue => {}
                DispatchOutcome::AbandonBatch => return Ok(()),
            }
        }
        Ok(())
    }

    fn dispatch_one(
        &mut self,
        consumer: &dyn Consumer,
        record: &ConsumerRecord,
        remaining: &[ConsumerRecord],
    ) -> Result<DispatchOutcome> {
        let tp = record.topic_partition();
        self.tracker.record_delivered(&tp, record.offset);

        if let Some(factory) = self.tx_factory.clone() {
            return self.dispatch_one_tx(consumer, &factory, record, remaining);
        }

        let intercepted = match self.intercept_record(consumer, record) {
            Some(record) => record,
            None => {
                debug!(
                    container = %self.shared.id(),
                    offset = %record.offset,
                    "Record skipped by interceptor"
                );
                self.tracker.record_processed(&tp, record.offset);
                return Ok(DispatchOutcome::Continue);
            }
        };

        match self.invoke_record_listener(consumer, &intercepted) {
            Ok(()) => {
                self.record_success(consumer, &intercepted);
                if self.properties.ack_mode == AckMode::Record
                    || self.properties.ack_mode == AckMode::ManualImmediate
                {
                    self.drain_acks(consumer)?;
                    self.commit_ready(consumer)?;
                }
                Ok(DispatchOutcome::Continue)
            }
            Err(listener_error) => {
                self.interceptor_failure(consumer, &intercepted, &listener_error);
                self.handle_record_error(consumer, listener_error, &intercepted, remaining)
            }
        }
    }

    fn dispatch_one_tx(
        &mut self,
        consumer: &dyn Consumer,
        factory: &Arc<PooledProducerFactory>,
        record: &ConsumerRecord,
        remaining: &[ConsumerRecord],
    ) -> Result<DispatchOutcome> {
        let tp = record.topic_partition();
        let producer = factory.create_producer_for(&self.group_id, &tp)?;

        let intercepted = if self.properties.intercept_before_tx {
            let intercepted = self.intercept_record(consumer, record);
            producer.begin_transaction()?;
            intercepted
        } else {
            producer.begin_transaction()?;
            self.intercept_record(consumer, record)
        };

        let Some(intercepted) = intercepted else {
            // Skipped records still advance the transactional offsets.
            self.tracker.record_processed(&tp, record.offset);
            return self.commit_tx_unit(consumer, &producer).map(|()| DispatchOutcome::Continue);
        };

        match self.invoke_record_listener(consumer, &intercepted) {
            Ok(()) => {
                self.record_success(consumer, &intercepted);
                self.drain_acks(consumer)?;
                self.commit_tx_unit(consumer, &producer)?;
                Ok(DispatchOutcome::Continue)
            }
            Err(listener_error) => {
                self.interceptor_failure(consumer, &intercepted, &listener_error);
                let mut rolled_back = Vec::with_capacity(remaining.len() + 1);
                rolled_back.push(intercepted.clone());
                rolled_back.extend_from_slice(remaining);
                self.after_rollback
                    .lock()
                    .process(&rolled_back, consumer, &listener_error)?;
                self.note_seek_back(&rolled_back);
                if let Err(e) = producer.abort_transaction() {
                    return self.map_producer_error(e).map(|()| DispatchOutcome::AbandonBatch);
                }
                Ok(DispatchOutcome::AbandonBatch)
            }
        }
    }

    fn commit_tx_unit(&mut self, consumer: &dyn Consumer, producer: &dyn Producer) -> Result<()> {
        let offsets = self.tracker.take_all_pending();
        if !offsets.is_empty() {
            let metadata = match &self.group_metadata {
                Some(metadata) => metadata.clone(),
                None => consumer.group_metadata(),
            };
            if let Err(e) = producer.send_offsets_to_transaction(&offsets, &metadata) {
                return self.map_producer_error(e);
            }
        }
        if let Err(e) = producer.commit_transaction() {
            return self.map_producer_error(e);
        }
        Ok(())
    }

    fn map_producer_error(&mut self, error: ConveyorError) -> Result<()> {
        if error.is_fenced() {
            warn!(container = %self.shared.id(), error = %error, "Transactional producer fenced");
            if self.properties.stop_container_when_fenced {
                return Err(error);
            }
            return Ok(());
        }
        Err(error)
    }

    fn record_success(&mut self, consumer: &dyn Consumer, record: &ConsumerRecord) {
        for interceptor in self.interceptors.iter() {
            interceptor.success(record, consumer);
        }
        self.error_handler.lock().record_succeeded(record);
        if !self.properties.ack_mode.is_manual() {
            let tp = record.topic_partition();
            self.tracker.record_processed(&tp, record.offset);
        }
    }

    fn intercept_record(
        &self,
        consumer: &dyn Consumer,
        record: &ConsumerRecord,
    ) -> Option<ConsumerRecord> {
        let mut current = record.clone();
        for interceptor in self.interceptors.iter() {
            current = interceptor.intercept(&current, consumer)?;
        }
        Some(current)
    }

    fn interceptor_failure(
        &self,
        consumer: &dyn Consumer,
        record: &ConsumerRecord,
        error: &ListenerError,
    ) {
        for interceptor in self.interceptors.iter() {
            interceptor.failure(record, error, consumer);
        }
    }

    fn invoke_record_listener(
        &mut self,
        consumer: &dyn Consumer,
        record: &ConsumerRecord,
    ) -> std::result::Result<(), ListenerError> {
        let mut guard = self.dispatcher.lock();
        let capabilities = guard.capabilities;
        let needs_ack = capabilities.needs_ack || self.properties.ack_mode.is_manual();
        let ack = needs_ack.then(|| {
            Acknowledgment::new(record.topic_partition(), record.offset, self.ack_tx.clone())
        });
        let mut ctx = ListenerContext {
            consumer: capabilities.needs_consumer.then_some(consumer),
            ack,
            seeks: capabilities
                .needs_seek_callback
                .then(|| self.seek_handle.clone()),
            group_id: &self.group_id,
        };
        match &mut guard.variant {
            DispatchVariant::Record(listener) => listener.on_record(record, &mut ctx),
            DispatchVariant::DeferredRecord(listener) => {
                let token = listener.on_record(record, &mut ctx);
                token.await_outcome(self.properties.sync_commit_timeout)
            }
            DispatchVariant::Batch(_) => Err(ListenerError::new(
                "DispatchMismatch",
                "batch dispatcher received a single record",
            )),
        }
    }

    fn handle_record_error(
        &mut self,
        consumer: &dyn Consumer,
        error: ListenerError,
        failed: &ConsumerRecord,
        remaining: &[ConsumerRecord],
    ) -> Result<DispatchOutcome> {
        let handle = self.handle.clone();
        let decision = self.error_handler.lock().handle_record_failure(
            &error,
            failed,
            remaining,
            consumer,
            &handle,
        );
        match decision {
            Decision::Handled | Decision::DeadLettered => {
                let tp = failed.topic_partition();
                self.tracker.record_processed(&tp, failed.offset);
                Ok(DispatchOutcome::Continue)
            }
            Decision::SeekAndRetry => {
                let delay = self.error_handler.lock().retry_delay_for(failed);
                let mut undispatched = Vec::with_capacity(remaining.len() + 1);
                undispatched.push(failed.clone());
                undispatched.extend_from_slice(remaining);
                self.seek_back_over(consumer, &undispatched)?;
                if delay > Duration::ZERO {
                    let tp = failed.topic_partition();
                    consumer.pause(std::slice::from_ref(&tp))?;
                    self.shared.note_client_paused(tp.clone(), true);
                    self.resume_at.insert(tp, Instant::now() + delay);
                }
                Ok(DispatchOutcome::AbandonBatch)
            }
            Decision::Retain => {
                let delay = self.error_handler.lock().retry_delay_for(failed);
                let mut kept = Vec::with_capacity(remaining.len() + 1);
                kept.push(failed.clone());
                kept.extend_from_slice(remaining);
                let partitions: HashSet<TopicPartition> =
                    kept.iter().map(|r| r.topic_partition()).collect();
                for tp in &partitions {
                    consumer.pause(std::slice::from_ref(tp))?;
                    self.shared.note_client_paused(tp.clone(), true);
                }
                self.retained_paused.extend(partitions);
                self.remaining = Some(kept);
                self.retained_resume_at =
                    (delay > Duration::ZERO).then(|| Instant::now() + delay);
                Ok(DispatchOutcome::AbandonBatch)
            }
            Decision::Fatal => Err(ConveyorError::Listener(error)),
        }
    }

    fn dispatch_batch_listener(
        &mut self,
        consumer: &dyn Consumer,
        batch: RecordBatch,
    ) -> Result<()> {
        let units: Vec<Vec<ConsumerRecord>> =
            if self.properties.sub_batch_per_partition && self.tx_factory.is_some() {
                batch.by_partition().into_iter().map(|(_, r)| r).collect()
            } else {
                vec![batch.into_records()]
            };

        for (index, unit) in units.iter().enumerate() {
            if unit.is_empty() {
                continue;
            }
            // Under pause-immediate the current sub-batch finishes and
            // commits before the pause takes effect.
            if index > 0
                && self.properties.pause_immediate
                && self.shared.is_pause_requested()
                && !self.paused_applied
            {
                let rest: Vec<ConsumerRecord> =
                    units[index..].iter().flatten().cloned().collect();
                self.seek_back_over(consumer, &rest)?;
                return Ok(());
            }
            match self.dispatch_batch_unit(consumer, unit)? {
                DispatchOutcome::Continue => {}
                DispatchOutcome::AbandonBatch => return Ok(()),
            }
        }
        Ok(())
    }

    fn dispatch_batch_unit(
        &mut self,
        consumer: &dyn Consumer,
        unit: &[ConsumerRecord],
    ) -> Result<DispatchOutcome> {
        if let Some(first) = unit.first() {
            if let Some(deadline) = headers::backoff_deadline(first) {
                let now = now_ms();
                if deadline > now {
                    let tp = first.topic_partition();
                    self.delay_partition(
                        consumer,
                        &tp,
                        first.offset,
                        Duration::from_millis((deadline - now) as u64),
                    )?;
                    return Ok(DispatchOutcome::Continue);
                }
            }
        }
        for record in unit {
            let tp = record.topic_partition();
            self.tracker.record_delivered(&tp, record.offset);
        }

        if let Some(factory) = self.tx_factory.clone() {
            return self.dispatch_batch_unit_tx(consumer, &factory, unit);
        }

        let intercepted = match self.intercept_batch(consumer, unit) {
            Some(records) => records,
            None => {
                self.mark_batch_processed(unit);
                return Ok(DispatchOutcome::Continue);
            }
        };

        match self.invoke_batch_listener(consumer, &intercepted) {
            Ok(()) => {
                self.batch_success(consumer, &intercepted);
                Ok(DispatchOutcome::Continue)
            }
            Err(listener_error) => {
                for interceptor in self.batch_interceptors.iter() {
                    interceptor.failure(&intercepted, &listener_error, consumer);
                }
                self.handle_batch_error(consumer, listener_error, &intercepted)
            }
        }
    }

    fn dispatch_batch_unit_tx(
        &mut self,
        consumer: &dyn Consumer,
        factory: &Arc<PooledProducerFactory>,
        unit: &[ConsumerRecord],
    ) -> Result<DispatchOutcome> {
        let first_tp = match unit.first() {
            Some(first) => first.topic_partition(),
            None => return Ok(DispatchOutcome::Continue),
        };
        let producer = factory.create_producer_for(&self.group_id, &first_tp)?;

        let intercepted = if self.properties.intercept_before_tx {
            let intercepted = self.intercept_batch(consumer, unit);
            producer.begin_transaction()?;
            intercepted
        } else {
            producer.begin_transaction()?;
            self.intercept_batch(consumer, unit)
        };

        let Some(intercepted) = intercepted else {
            self.mark_batch_processed(unit);
            return self.commit_tx_unit(consumer, &producer).map(|()| DispatchOutcome::Continue);
        };

        match self.invoke_batch_listener(consumer, &intercepted) {
            Ok(()) => {
                self.batch_success(consumer, &intercepted);
                self.drain_acks(consumer)?;
                self.commit_tx_unit(consumer, &producer)?;
                Ok(DispatchOutcome::Continue)
            }
            Err(listener_error) => {
                for interceptor in self.batch_interceptors.iter() {
                    interceptor.failure(&intercepted, &listener_error, consumer);
                }
                self.after_rollback
                    .lock()
                    .process(&intercepted, consumer, &listener_error)?;
                self.note_seek_back(&intercepted);
                if let Err(e) = producer.abort_transaction() {
                    return self.map_producer_error(e).map(|()| DispatchOutcome::AbandonBatch);
                }
                Ok(DispatchOutcome::AbandonBatch)
            }
        }
    }

    fn intercept_batch(
        &self,
        consumer: &dyn Consumer,
        records: &[ConsumerRecord],
    ) -> Option<Vec<ConsumerRecord>> {
        let mut current = records.to_vec();
        for interceptor in self.batch_interceptors.iter() {
            current = interceptor.intercept(&current, consumer)?;
        }
        Some(current)
    }

    fn invoke_batch_listener(
        &mut self,
        consumer: &dyn Consumer,
        records: &[ConsumerRecord],
    ) -> std::result::Result<(), ListenerError> {
        let mut guard = self.dispatcher.lock();
        let capabilities = guard.capabilities;
        let needs_ack = capabilities.needs_ack || self.properties.ack_mode.is_manual();
        let ack = needs_ack.then(|| {
            records
                .last()
                .map(|last| {
                    Acknowledgment::new(last.topic_partition(), last.offset, self.ack_tx.clone())
                })
        });
        let mut ctx = ListenerContext {
            consumer: capabilities.needs_consumer.then_some(consumer),
            ack: ack.flatten(),
            seeks: capabilities
                .needs_seek_callback
                .then(|| self.seek_handle.clone()),
            group_id: &self.group_id,
        };
        match &mut guard.variant {
            DispatchVariant::Batch(listener) => listener.on_batch(records, &mut ctx),
            _ => Err(ListenerError::new(
                "DispatchMismatch",
                "record dispatcher received a batch",
            )),
        }
    }

    fn batch_success(&mut self, consumer: &dyn Consumer, records: &[ConsumerRecord]) {
        for interceptor in self.batch_interceptors.iter() {
            interceptor.success(records, consumer);
        }
        if let Some(first) = records.first() {
            self.error_handler.lock().record_succeeded(first);
        }
        self.mark_batch_processed(records);
    }

    fn mark_batch_processed(&mut self, records: &[ConsumerRecord]) {
        if self.properties.ack_mode.is_manual() {
            return;
        }
        for record in records {
            let tp = record.topic_partition();
            self.tracker.record_processed(&tp, record.offset);
        }
    }

    fn handle_batch_error(
        &mut self,
        consumer: &dyn Consumer,
        error: ListenerError,
        records: &[ConsumerRecord],
    ) -> Result<DispatchOutcome> {
        let handle = self.handle.clone();
        let decision =
            self.error_handler
                .lock()
                .handle_batch_failure(&error, records, consumer, &handle);
        match decision {
            Decision::Handled | Decision::DeadLettered => {
                self.mark_batch_processed(records);
                Ok(DispatchOutcome::Continue)
            }
            Decision::SeekAndRetry => {
                self.seek_back_over(consumer, records)?;
                Ok(DispatchOutcome::AbandonBatch)
            }
            Decision::Retain => {
                let partitions: HashSet<TopicPartition> =
                    records.iter().map(|r| r.topic_partition()).collect();
                for tp in &partitions {
                    consumer.pause(std::slice::from_ref(tp))?;
                    self.shared.note_client_paused(tp.clone(), true);
                }
                self.retained_paused.extend(partitions);
                self.remaining = Some(records.to_vec());
                let delay = records
                    .first()
                    .map(|first| self.error_handler.lock().retry_delay_for(first))
                    .unwrap_or(Duration::ZERO);
                self.retained_resume_at =
                    (delay > Duration::ZERO).then(|| Instant::now() + delay);
                Ok(DispatchOutcome::AbandonBatch)
            }
            Decision::Fatal => Err(ConveyorError::Listener(error)),
        }
    }

    /// Seek every partition of the given records back to its earliest
    /// undispatched offset
    fn seek_back_over(&mut self, consumer: &dyn Consumer, records: &[ConsumerRecord]) -> Result<()> {
        let mut targets: BTreeMap<TopicPartition, i64> = BTreeMap::new();
        for record in records {
            let entry = targets.entry(record.topic_partition()).or_insert(record.offset);
            if record.offset < *entry {
                *entry = record.offset;
            }
        }
        for (tp, offset) in targets {
            debug!(container = %self.shared.id(), partition = %tp, offset = %offset, "Seeking back");
            consumer.seek(&tp, offset)?;
            self.tracker.on_seek(&tp, offset);
        }
        Ok(())
    }

    /// Record that the after-rollback processor seeked these records back
    fn note_seek_back(&mut self, records: &[ConsumerRecord]) {
        let mut targets: BTreeMap<TopicPartition, i64> = BTreeMap::new();
        for record in records {
            let entry = targets.entry(record.topic_partition()).or_insert(record.offset);
            if record.offset < *entry {
                *entry = record.offset;
            }
        }
        for (tp, offset) in targets {
            self.tracker.on_seek(&tp, offset);
        }
    }

    fn delay_partition(
        &mut self,
        consumer: &dyn Consumer,
        tp: &TopicPartition,
        offset: i64,
        remaining: Duration,
    ) -> Result<()> {
        debug!(
            container = %self.shared.id(),
            partition = %tp,
            offset = %offset,
            delay_ms = remaining.as_millis() as u64,
            "Record not yet due, pausing partition until its deadline"
        );
        consumer.seek(tp, offset)?;
        self.tracker.on_seek(tp, offset);
        consumer.pause(std::slice::from_ref(tp))?;
        self.shared.note_client_paused(tp.clone(), true);
        self.resume_at.insert(tp.clone(), Instant::now() + remaining);
        self.publish(EventKind::PartitionPaused {
            partition: tp.clone(),
        });
        Ok(())
    }

    // ── retained records ──

    fn redeliver_retained(&mut self, consumer: &dyn Consumer) -> Result<()> {
        if self.remaining.is_none() {
            return Ok(());
        }
        if let Some(resume_at) = self.retained_resume_at {
            if Instant::now() < resume_at {
                return Ok(());
            }
        }
        let Some(records) = self.remaining.take() else {
            return Ok(());
        };
        self.retained_resume_at = None;

        for index in 0..records.len() {
            let record = records[index].clone();
            match self.dispatch_one(consumer, &record, &records[index + 1..])? {
                DispatchOutcome::Continue => {}
                // Failed again; the error handler re-retained the rest.
                DispatchOutcome::AbandonBatch => return Ok(()),
            }
        }
        self.resume_retained(consumer)
    }

    fn resume_retained(&mut self, consumer: &dyn Consumer) -> Result<()> {
        let assigned = self.shared.assigned_partitions();
        for tp in self.retained_paused.drain().collect::<Vec<_>>() {
            let held = self.shared.is_pause_requested()
                || self.shared.partition_pause_requested(&tp)
                || self.resume_at.contains_key(&tp);
            if assigned.contains(&tp) && !held {
                consumer.resume(std::slice::from_ref(&tp))?;
                self.shared.note_client_paused(tp, false);
            }
        }
        Ok(())
    }

    // ── acks and commits ──

    fn drain_acks(&mut self, consumer: &dyn Consumer) -> Result<()> {
        let pending: Vec<AckMessage> = self.acks.try_iter().collect();
        for message in pending {
            match message.signal {
                AckSignal::Ack => {
                    self.tracker.record_acked(&message.tp, message.offset);
                }
                AckSignal::Nack { sleep } => {
                    consumer.seek(&message.tp, message.offset)?;
                    self.tracker.on_seek(&message.tp, message.offset);
                    consumer.pause(std::slice::from_ref(&message.tp))?;
                    self.shared.note_client_paused(message.tp.clone(), true);
                    self.resume_at
                        .insert(message.tp.clone(), Instant::now() + sleep);
                    self.publish(EventKind::PartitionPaused {
                        partition: message.tp,
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_gap_transitions(&mut self, consumer: &dyn Consumer) -> Result<()> {
        let transitions = self.tracker.gap_transitions();
        for tp in transitions.to_pause {
            consumer.pause(std::slice::from_ref(&tp))?;
            self.shared.note_client_paused(tp.clone(), true);
            self.publish(EventKind::PartitionPaused { partition: tp });
        }
        for tp in transitions.to_resume {
            let held = self.shared.is_pause_requested()
                || self.shared.partition_pause_requested(&tp)
                || self.resume_at.contains_key(&tp)
                || self.retained_paused.contains(&tp);
            if !held && self.is_assigned(&tp) {
                consumer.resume(std::slice::from_ref(&tp))?;
                self.shared.note_client_paused(tp.clone(), false);
                self.publish(EventKind::PartitionResumed { partition: tp });
            }
        }
        Ok(())
    }

    fn commit_ready(&mut self, consumer: &dyn Consumer) -> Result<()> {
        let offsets = self.tracker.take_commits();
        self.commit(consumer, offsets)
    }

    fn commit(&mut self, consumer: &dyn Consumer, offsets: OffsetMap) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        // Under transactions every offset must travel with a producer, even
        // those surfacing outside a dispatch unit (late async acks).
        if let Some(factory) = self.tx_factory.clone() {
            let producer = factory.create_producer()?;
            producer.begin_transaction()?;
            let metadata = match &self.group_metadata {
                Some(metadata) => metadata.clone(),
                None => consumer.group_metadata(),
            };
            if let Err(e) = producer
                .send_offsets_to_transaction(&offsets, &metadata)
                .and_then(|()| producer.commit_transaction())
            {
                return self.map_producer_error(e);
            }
            return Ok(());
        }

        if self.properties.sync_commits {
            let retries = self.properties.commit_retries.max(1);
            let mut last_error = None;
            for attempt in 1..=retries {
                match consumer.commit_sync(&offsets, self.properties.sync_commit_timeout) {
                    Ok(()) => {
                        debug!(
                            container = %self.shared.id(),
                            partitions = offsets.len(),
                            "Offsets committed"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            container = %self.shared.id(),
                            attempt = %attempt,
                            error = %e,
                            "Offset commit failed"
                        );
                        last_error = Some(e);
                    }
                }
            }
            let message = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            self.publish(EventKind::CommitFailed {
                reason: message.clone(),
            });
            Err(ConveyorError::CommitFailed {
                attempts: retries,
                message,
            })
        } else {
            let events = self.events.clone();
            let container_id = self.shared.id().to_string();
            let user_callback = self.properties.commit_callback.clone();
            consumer.commit_async(
                &offsets,
                Arc::new(move |offsets: &OffsetMap, error: Option<&ConveyorError>| {
                    if let Some(callback) = &user_callback {
                        callback(offsets, error);
                    }
                    if let Some(error) = error {
                        events.publish(ContainerEvent::now(
                            &container_id,
                            EventKind::CommitFailed {
                                reason: error.to_string(),
                            },
                        ));
                    }
                }),
            )
        }
    }

    /// Initialize partition state for an explicitly assigned container.
    /// No rebalance event is published and the user rebalance listener is
    /// not invoked; this is not a group rebalance.
    fn init_explicit_assignment(
        &mut self,
        consumer: &dyn Consumer,
        partitions: &[TopicPartition],
    ) -> Result<()> {
        for tp in partitions {
            self.tracker.on_partition_assigned(tp);
            self.partition_last_receive.insert(tp.clone(), Instant::now());
        }
        self.shared.set_assigned(partitions.to_vec());
        self.first_assignment_seen = true;
        self.initial_commit(consumer, partitions)?;
        for tp in partitions {
            if self.shared.partition_pause_requested(tp) {
                consumer.pause(std::slice::from_ref(tp))?;
                self.shared.note_client_paused(tp.clone(), true);
            }
        }
        Ok(())
    }

    // ── assignment-commit policy ──

    fn initial_commit(
        &mut self,
        consumer: &dyn Consumer,
        partitions: &[TopicPartition],
    ) -> Result<()> {
        let option = self.properties.assignment_commit_option;
        if !option.may_commit() {
            return Ok(());
        }
        if option.latest_only() && consumer.reset_policy() != crate::client::OffsetResetPolicy::Latest
        {
            return Ok(());
        }

        let committed = consumer.committed(partitions)?;
        let mut offsets = OffsetMap::new();
        for tp in partitions {
            let has_commit = committed.get(tp).map(|c| c.is_some()).unwrap_or(false);
            if !has_commit {
                offsets.insert(tp.clone(), OffsetAndMetadata::new(consumer.position(tp)?));
            }
        }
        if offsets.is_empty() {
            return Ok(());
        }

        debug!(
            container = %self.shared.id(),
            partitions = offsets.len(),
            "Committing initial positions on first assignment"
        );
        let use_tx = option == AssignmentCommitOption::LatestOnly
            || option == AssignmentCommitOption::Always;
        match (&self.tx_factory, use_tx) {
            (Some(factory), true) => {
                // Throwaway transaction carrying only the initial offsets.
                let producer = factory.create_producer()?;
                producer.begin_transaction()?;
                producer.send_offsets_to_transaction(&offsets, &consumer.group_metadata())?;
                producer.commit_transaction()?;
                Ok(())
            }
            _ => consumer.commit_sync(&offsets, self.properties.sync_commit_timeout),
        }
    }
}

impl RebalanceHandler for LoopState {
    fn on_partitions_assigned(
        &mut self,
        consumer: &dyn Consumer,
        partitions: &[TopicPartition],
    ) -> Result<()> {
        for tp in partitions {
            self.tracker.on_partition_assigned(tp);
            self.partition_last_receive.insert(tp.clone(), Instant::now());
        }
        self.shared
            .set_assigned(consumer.assignment().unwrap_or_default());

        if !self.first_assignment_seen {
            self.first_assignment_seen = true;
            self.initial_commit(consumer, partitions)?;
        }

        // Re-apply pauses that survived the rebalance.
        if self.shared.is_pause_requested() {
            consumer.pause(partitions)?;
            for tp in partitions {
                self.shared.note_client_paused(tp.clone(), true);
            }
        } else {
            for tp in partitions {
                if self.shared.partition_pause_requested(tp) {
                    consumer.pause(std::slice::from_ref(tp))?;
                    self.shared.note_client_paused(tp.clone(), true);
                    self.publish(EventKind::PartitionPaused {
                        partition: tp.clone(),
                    });
                }
            }
        }

        self.rebalance_listener
            .lock()
            .on_partitions_assigned(consumer, partitions);
        self.publish(EventKind::RebalanceAssigned {
            partitions: partitions.to_vec(),
        });
        Ok(())
    }

    fn on_partitions_revoked(&mut self, consumer: &dyn Consumer, partitions: &[TopicPartition]) {
        self.rebalance_listener
            .lock()
            .on_partitions_revoked_before_commit(consumer, partitions);

        // Prune retained records for partitions that are going away; they
        // must never reach the listener after the revoke completes.
        if let Some(remaining) = &mut self.remaining {
            remaining.retain(|record| !partitions.contains(&record.topic_partition()));
            let emptied = remaining.is_empty();
            if emptied {
                self.remaining = None;
                self.retained_resume_at = None;
            }
        }
        for tp in partitions {
            self.retained_paused.remove(tp);
            self.resume_at.remove(tp);
        }
        if self.remaining.is_none() && !self.retained_paused.is_empty() {
            // Everything retained was pruned; release the survivors.
            let survivors: Vec<TopicPartition> = self.retained_paused.drain().collect();
            for tp in survivors {
                if !partitions.contains(&tp) && !self.shared.is_pause_requested() {
                    let _ = consumer.resume(std::slice::from_ref(&tp));
                    self.shared.note_client_paused(tp, false);
                }
            }
        }

        let offsets = self.tracker.on_partitions_revoked(partitions);
        if !offsets.is_empty() {
            if let Err(e) = consumer.commit_sync(&offsets, self.properties.sync_commit_timeout) {
                warn!(container = %self.shared.id(), error = %e, "Commit before revocation failed");
                self.publish(EventKind::CommitFailed {
                    reason: e.to_string(),
                });
            }
        }

        self.rebalance_listener
            .lock()
            .on_partitions_revoked_after_commit(consumer, partitions);

        let assigned: Vec<TopicPartition> = self
            .shared
            .assigned_partitions()
            .into_iter()
            .filter(|tp| !partitions.contains(tp))
            .collect();
        self.shared.set_assigned(assigned);
        for tp in partitions {
            self.shared.note_client_paused(tp.clone(), false);
            self.partition_last_receive.remove(tp);
            self.partition_last_idle_emit.remove(tp);
        }
        self.publish(EventKind::RebalanceRevoked {
            partitions: partitions.to_vec(),
        });
    }

    fn on_partitions_lost(&mut self, consumer: &dyn Consumer, partitions: &[TopicPartition]) {
        // Lost partitions are already owned elsewhere: drop state without
        // committing and without routing through the revoke path.
        self.tracker.on_partitions_lost(partitions);
        if let Some(remaining) = &mut self.remaining {
            remaining.retain(|record| !partitions.contains(&record.topic_partition()));
            if remaining.is_empty() {
                self.remaining = None;
                self.retained_resume_at = None;
            }
        }
        for tp in partitions {
            self.retained_paused.remove(tp);
            self.resume_at.remove(tp);
            self.shared.note_client_paused(tp.clone(), false);
            self.partition_last_receive.remove(tp);
            self.partition_last_idle_emit.remove(tp);
        }
        let assigned: Vec<TopicPartition> = self
            .shared
            .assigned_partitions()
            .into_iter()
            .filter(|tp| !partitions.contains(tp))
            .collect();
        self.shared.set_assigned(assigned);

        self.rebalance_listener
            .lock()
            .on_partitions_lost(consumer, partitions);
        self.publish(EventKind::RebalanceLost {
            partitions: partitions.to_vec(),
        });
    }
}
