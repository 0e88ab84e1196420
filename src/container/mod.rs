//! Listener containers
//!
//! A single-threaded container owns exactly one consumer and one poll
//! thread; the concurrent container supervises N of them. External callers
//! never touch the consumer: pause, resume, seek, and stop requests cross
//! the thread boundary through a command queue drained at the top of every
//! poll iteration.

pub mod ack;
pub mod concurrent;
pub mod listener;
pub mod offset_tracker;
pub mod rebalance;
pub mod seek;
pub mod single;

pub use ack::{AckMessage, AckSignal, Acknowledgment};
pub use concurrent::ConcurrentListenerContainer;
pub use listener::{
    ArgumentSource, ArgumentValue, BatchInterceptor, BatchListener, BindingPlan,
    BoundRecordListener, CompletionHandle, CompletionToken, CompositeBatchInterceptor,
    CompositeRecordInterceptor, DeferredRecordListener, DispatchVariant, FnBatchListener,
    FnRecordListener,
    ListenerCapabilities, ListenerContext, MessageDispatcher, RecordInterceptor, RecordListener,
};
pub use offset_tracker::{GapTransitions, OffsetTracker};
pub use rebalance::{ContainerRebalanceListener, NoopRebalanceListener};
pub use seek::{SeekHandle, SeekRequest};
pub use single::{ListenerContainerBuilder, MessageListenerContainer};

use crate::client::{ConsumerWaker, TopicPartition};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Not running; the initial and terminal state
    Stopped,
    /// Consumer creation in progress
    Starting,
    /// Poll loop active
    Running,
    /// Stop requested; the loop finishes its current iteration
    Stopping,
}

impl ContainerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ContainerState::Starting,
            2 => ContainerState::Running,
            3 => ContainerState::Stopping,
            _ => ContainerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ContainerState::Stopped => 0,
            ContainerState::Starting => 1,
            ContainerState::Running => 2,
            ContainerState::Stopping => 3,
        }
    }
}

/// Requests posted to the poll thread
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Pause,
    Resume,
    PausePartition(TopicPartition),
    ResumePartition(TopicPartition),
    Stop { immediate: bool },
}

/// State shared between a container handle and its poll thread
pub struct ContainerShared {
    id: String,
    state: AtomicU8,
    pause_requested: AtomicBool,
    requested_partition_pauses: Mutex<HashSet<TopicPartition>>,
    assigned: RwLock<Vec<TopicPartition>>,
    client_paused: RwLock<HashSet<TopicPartition>>,
    last_poll_return: Mutex<Instant>,
    waker: Mutex<Option<Arc<dyn ConsumerWaker>>>,
}

impl ContainerShared {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            state: AtomicU8::new(ContainerState::Stopped.as_u8()),
            pause_requested: AtomicBool::new(false),
            requested_partition_pauses: Mutex::new(HashSet::new()),
            assigned: RwLock::new(Vec::new()),
            client_paused: RwLock::new(HashSet::new()),
            last_poll_return: Mutex::new(Instant::now()),
            waker: Mutex::new(None),
        }
    }

    /// Container id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ContainerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn transition(&self, from: ContainerState, to: ContainerState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Whether a container-wide pause has been requested
    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pause_requested(&self, requested: bool) {
        self.pause_requested.store(requested, Ordering::SeqCst);
    }

    /// Record a per-partition pause request; it survives revocation and
    /// re-applies on reassignment
    pub(crate) fn request_partition_pause(&self, tp: TopicPartition) {
        self.requested_partition_pauses.lock().insert(tp);
    }

    pub(crate) fn clear_partition_pause(&self, tp: &TopicPartition) {
        self.requested_partition_pauses.lock().remove(tp);
    }

    pub(crate) fn partition_pause_requested(&self, tp: &TopicPartition) -> bool {
        self.requested_partition_pauses.lock().contains(tp)
    }

    /// Partitions currently assigned to the consumer
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.assigned.read().clone()
    }

    pub(crate) fn set_assigned(&self, partitions: Vec<TopicPartition>) {
        *self.assigned.write() = partitions;
    }

    pub(crate) fn note_client_paused(&self, tp: TopicPartition, paused: bool) {
        let mut set = self.client_paused.write();
        if paused {
            set.insert(tp);
        } else {
            set.remove(&tp);
        }
    }

    /// True iff a pause was requested and every assigned partition is
    /// effectively paused at the client
    pub fn is_container_paused(&self) -> bool {
        if !self.is_pause_requested() {
            return false;
        }
        let assigned = self.assigned.read();
        let paused = self.client_paused.read();
        assigned.iter().all(|tp| paused.contains(tp))
    }

    pub(crate) fn note_poll_return(&self) {
        *self.last_poll_return.lock() = Instant::now();
    }

    pub(crate) fn since_last_poll(&self) -> std::time::Duration {
        self.last_poll_return.lock().elapsed()
    }

    pub(crate) fn set_waker(&self, waker: Option<Arc<dyn ConsumerWaker>>) {
        *self.waker.lock() = waker;
    }

    pub(crate) fn wakeup(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            waker.wakeup();
        }
    }
}

/// Indirection handle given to error handlers and other collaborators so
/// they can act on the container without holding it
#[derive(Clone)]
pub struct ContainerHandle {
    shared: Arc<ContainerShared>,
    commands: crossbeam_channel::Sender<Command>,
}

impl ContainerHandle {
    pub(crate) fn new(
        shared: Arc<ContainerShared>,
        commands: crossbeam_channel::Sender<Command>,
    ) -> Self {
        Self { shared, commands }
    }

    /// Container id
    pub fn id(&self) -> &str {
        self.shared.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContainerState {
        self.shared.state()
    }

    /// Request a container-wide pause
    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    /// Request a container-wide resume
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Request a pause for one partition
    pub fn pause_partition(&self, tp: TopicPartition) {
        let _ = self.commands.send(Command::PausePartition(tp));
    }

    /// Request a resume for one partition
    pub fn resume_partition(&self, tp: TopicPartition) {
        let _ = self.commands.send(Command::ResumePartition(tp));
    }

    /// Ask the container to stop after the current iteration
    pub fn request_stop(&self) {
        let _ = self.commands.send(Command::Stop { immediate: false });
        self.shared.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Starting,
            ContainerState::Running,
            ContainerState::Stopping,
        ] {
            assert_eq!(ContainerState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_transition_is_atomic() {
        let shared = ContainerShared::new("c-1".to_string());
        assert!(shared.transition(ContainerState::Stopped, ContainerState::Starting));
        assert!(!shared.transition(ContainerState::Stopped, ContainerState::Starting));
        assert_eq!(shared.state(), ContainerState::Starting);
    }

    #[test]
    fn test_container_paused_requires_full_coverage() {
        let shared = ContainerShared::new("c-1".to_string());
        let tp0 = TopicPartition::new("orders", 0);
        let tp1 = TopicPartition::new("orders", 1);
        shared.set_assigned(vec![tp0.clone(), tp1.clone()]);

        shared.set_pause_requested(true);
        assert!(!shared.is_container_paused());

        shared.note_client_paused(tp0.clone(), true);
        assert!(!shared.is_container_paused());

        shared.note_client_paused(tp1.clone(), true);
        assert!(shared.is_container_paused());

        shared.set_pause_requested(false);
        assert!(!shared.is_container_paused());
    }
}
