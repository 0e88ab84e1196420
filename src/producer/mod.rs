//! Pooled producer factory
//!
//! Caches producers behind a bounded pool of `transactional.id` suffixes.
//! A suffix is held while its producer is in use and returned on release,
//! so at most one un-closed producer ever exists for any
//! `(prefix, suffix)` pair. Under EOS-V2 group transactions the suffix for
//! a `(group, topic, partition)` work unit is allocated once and reused on
//! every restart of that unit, keeping fencing stable.

use crate::client::{
    ConsumerGroupMetadata, OffsetMap, Producer, ProducerRecord, RawProducerFactory, SendFuture,
    TopicPartition,
};
use crate::error::{ConveyorError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How the factory hands out producers
enum FactoryMode {
    /// Plain producers; optionally one per originating thread
    NonTransactional { per_thread: bool },
    /// Transactional producers keyed by `(prefix, suffix)`
    Transactional {
        prefix: String,
        /// Deterministic `(group, topic, partition)` suffix allocation
        group_suffixes: bool,
    },
}

struct PoolState {
    free_suffixes: BTreeSet<u32>,
    idle: HashMap<u32, Box<dyn Producer>>,
    group_assignments: HashMap<(String, String, i32), u32>,
}

/// Bounded cache of producers with transactional-suffix allocation
pub struct PooledProducerFactory {
    raw: Arc<dyn RawProducerFactory>,
    mode: FactoryMode,
    max_cache: usize,
    max_wait: Duration,
    fail_fast: bool,
    pool: Mutex<PoolState>,
    available: Condvar,
    shared: Mutex<Option<Arc<Box<dyn Producer>>>>,
    thread_bound: Mutex<HashMap<ThreadId, Arc<Box<dyn Producer>>>>,
}

impl PooledProducerFactory {
    /// Default number of pooled suffixes
    pub const DEFAULT_MAX_CACHE: usize = 5;

    /// Default block time when the pool is exhausted
    pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

    /// A non-transactional factory with one shared producer
    pub fn non_transactional(raw: Arc<dyn RawProducerFactory>) -> Self {
        Self::build(raw, FactoryMode::NonTransactional { per_thread: false })
    }

    /// A transactional factory with the given `transactional.id` prefix
    pub fn transactional(raw: Arc<dyn RawProducerFactory>, prefix: impl Into<String>) -> Self {
        Self::build(
            raw,
            FactoryMode::Transactional {
                prefix: prefix.into(),
                group_suffixes: false,
            },
        )
    }

    fn build(raw: Arc<dyn RawProducerFactory>, mode: FactoryMode) -> Self {
        Self {
            raw,
            mode,
            max_cache: Self::DEFAULT_MAX_CACHE,
            max_wait: Self::DEFAULT_MAX_WAIT,
            fail_fast: false,
            pool: Mutex::new(PoolState {
                free_suffixes: (0..Self::DEFAULT_MAX_CACHE as u32).collect(),
                idle: HashMap::new(),
                group_assignments: HashMap::new(),
            }),
            available: Condvar::new(),
            shared: Mutex::new(None),
            thread_bound: Mutex::new(HashMap::new()),
        }
    }

    /// Set the suffix pool size
    pub fn with_max_cache(mut self, max_cache: usize) -> Self {
        let max_cache = max_cache.max(1);
        self.max_cache = max_cache;
        self.pool.get_mut().free_suffixes = (0..max_cache as u32).collect();
        self
    }

    /// Set the block time when the pool is exhausted
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Fail immediately instead of blocking when the pool is exhausted
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Allocate suffixes deterministically per `(group, topic, partition)`
    /// work unit (EOS-V2 group transactions)
    pub fn with_group_suffixes(mut self, enabled: bool) -> Self {
        if let FactoryMode::Transactional { group_suffixes, .. } = &mut self.mode {
            *group_suffixes = enabled;
        }
        self
    }

    /// Give every originating thread its own non-transactional producer;
    /// callers release with [`Self::close_thread_bound_producer`]
    pub fn with_producer_per_thread(mut self, enabled: bool) -> Self {
        if let FactoryMode::NonTransactional { per_thread } = &mut self.mode {
            *per_thread = enabled;
        }
        self
    }

    /// Whether this factory hands out transactional producers
    pub fn is_transactional(&self) -> bool {
        matches!(self.mode, FactoryMode::Transactional { .. })
    }

    /// The configured `transactional.id` prefix, if transactional
    pub fn transactional_id_prefix(&self) -> Option<&str> {
        match &self.mode {
            FactoryMode::Transactional { prefix, .. } => Some(prefix),
            FactoryMode::NonTransactional { .. } => None,
        }
    }

    /// Acquire a producer from the cache, creating one if needed
    pub fn create_producer(self: &Arc<Self>) -> Result<PooledProducer> {
        match &self.mode {
            FactoryMode::NonTransactional { per_thread: false } => {
                let mut shared = self.shared.lock();
                let producer = match shared.as_ref() {
                    Some(producer) => producer.clone(),
                    None => {
                        let created: Arc<Box<dyn Producer>> =
                            Arc::new(self.raw.create_raw(None)?);
                        *shared = Some(created.clone());
                        created
                    }
                };
                Ok(PooledProducer::shared(self.clone(), producer))
            }
            FactoryMode::NonTransactional { per_thread: true } => {
                let thread = std::thread::current().id();
                let mut bound = self.thread_bound.lock();
                let producer = match bound.get(&thread) {
                    Some(producer) => producer.clone(),
                    None => {
                        let created: Arc<Box<dyn Producer>> =
                            Arc::new(self.raw.create_raw(None)?);
                        bound.insert(thread, created.clone());
                        created
                    }
                };
                Ok(PooledProducer::shared(self.clone(), producer))
            }
            FactoryMode::Transactional { .. } => self.acquire_transactional(None),
        }
    }

    /// Acquire the transactional producer for a consumer-group work unit.
    /// The same unit always receives the same suffix.
    pub fn create_producer_for(
        self: &Arc<Self>,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<PooledProducer> {
        match &self.mode {
            FactoryMode::Transactional {
                group_suffixes: true,
                ..
            } => self.acquire_transactional(Some((
                group_id.to_string(),
                tp.topic.clone(),
                tp.partition,
            ))),
            FactoryMode::Transactional { .. } => self.create_producer(),
            FactoryMode::NonTransactional { .. } => Err(ConveyorError::Config(
                "group-keyed producers require a transactional factory".to_string(),
            )),
        }
    }

    fn acquire_transactional(
        self: &Arc<Self>,
        group_key: Option<(String, String, i32)>,
    ) -> Result<PooledProducer> {
        let prefix = match &self.mode {
            FactoryMode::Transactional { prefix, .. } => prefix.clone(),
            FactoryMode::NonTransactional { .. } => {
                return Err(ConveyorError::Config(
                    "factory is not transactional".to_string(),
                ))
            }
        };

        let mut pool = self.pool.lock();
        let suffix = match &group_key {
            Some(key) => match pool.group_assignments.get(key).copied() {
                Some(suffix) => {
                    // Sticky assignment: the suffix never changes for this
                    // work unit, but it must be free before reuse.
                    self.wait_for_suffix(&mut pool, suffix)?;
                    suffix
                }
                None => {
                    let suffix = self.take_free_suffix(&mut pool)?;
                    pool.group_assignments.insert(key.clone(), suffix);
                    debug!(
                        group = %key.0,
                        topic = %key.1,
                        partition = %key.2,
                        suffix = %suffix,
                        "Bound work unit to transactional suffix"
                    );
                    suffix
                }
            },
            None => self.take_free_suffix(&mut pool)?,
        };

        let cached = pool.idle.remove(&suffix);
        drop(pool);

        let producer = match cached {
            Some(producer) => producer,
            None => {
                let transactional_id = format!("{prefix}-{suffix}");
                info!(transactional_id = %transactional_id, "Creating transactional producer");
                self.raw.create_raw(Some(&transactional_id))?
            }
        };
        Ok(PooledProducer::pooled(self.clone(), suffix, producer))
    }

    /// Remove the lowest free suffix, blocking or failing per policy
    fn take_free_suffix(&self, pool: &mut parking_lot::MutexGuard<'_, PoolState>) -> Result<u32> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            if let Some(suffix) = pool.free_suffixes.iter().next().copied() {
                pool.free_suffixes.remove(&suffix);
                return Ok(suffix);
            }
            self.block_or_fail(pool, deadline)?;
        }
    }

    /// Wait until a specific suffix is free, then claim it
    fn wait_for_suffix(
        &self,
        pool: &mut parking_lot::MutexGuard<'_, PoolState>,
        suffix: u32,
    ) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            if pool.free_suffixes.remove(&suffix) {
                return Ok(());
            }
            self.block_or_fail(pool, deadline)?;
        }
    }

    fn block_or_fail(
        &self,
        pool: &mut parking_lot::MutexGuard<'_, PoolState>,
        deadline: Instant,
    ) -> Result<()> {
        if self.fail_fast {
            return Err(ConveyorError::NoProducerAvailable { waited_ms: 0 });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || self.available.wait_for(pool, remaining).timed_out() {
            return Err(ConveyorError::NoProducerAvailable {
                waited_ms: self.max_wait.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn release(&self, suffix: u32, producer: Option<Box<dyn Producer>>, discard: bool) {
        let mut pool = self.pool.lock();
        match (producer, discard) {
            (Some(producer), false) => {
                pool.idle.insert(suffix, producer);
            }
            (Some(producer), true) => {
                warn!(suffix = %suffix, "Discarding producer; slot invalidated");
                producer.close(Duration::from_secs(5));
            }
            (None, _) => {}
        }
        pool.free_suffixes.insert(suffix);
        drop(pool);
        self.available.notify_one();
    }

    /// Close and drop the current thread's bound producer
    pub fn close_thread_bound_producer(&self) {
        let thread = std::thread::current().id();
        if let Some(producer) = self.thread_bound.lock().remove(&thread) {
            producer.close(Duration::from_secs(5));
        }
    }

    /// Close every cached producer; subsequent acquisitions create fresh
    /// ones
    pub fn reset(&self) {
        let mut pool = self.pool.lock();
        for (_, producer) in pool.idle.drain() {
            producer.close(Duration::from_secs(5));
        }
        drop(pool);
        if let Some(producer) = self.shared.lock().take() {
            producer.close(Duration::from_secs(5));
        }
        for (_, producer) in self.thread_bound.lock().drain() {
            producer.close(Duration::from_secs(5));
        }
    }
}

enum Hold {
    /// Owned transactional producer bound to a suffix slot
    Pooled {
        factory: Arc<PooledProducerFactory>,
        suffix: u32,
        producer: Option<Box<dyn Producer>>,
    },
    /// Shared non-transactional producer; physical close is the factory's
    Shared {
        _factory: Arc<PooledProducerFactory>,
        producer: Arc<Box<dyn Producer>>,
    },
}

/// A producer borrowed from the pool. Dropping it (or calling `close`)
/// returns the slot; a fenced or poisoned producer is discarded instead of
/// being returned.
pub struct PooledProducer {
    hold: Option<Hold>,
    fenced: AtomicBool,
    poisoned: AtomicBool,
}

impl PooledProducer {
    fn pooled(factory: Arc<PooledProducerFactory>, suffix: u32, producer: Box<dyn Producer>) -> Self {
        Self {
            hold: Some(Hold::Pooled {
                factory,
                suffix,
                producer: Some(producer),
            }),
            fenced: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        }
    }

    fn shared(factory: Arc<PooledProducerFactory>, producer: Arc<Box<dyn Producer>>) -> Self {
        Self {
            hold: Some(Hold::Shared {
                _factory: factory,
                producer,
            }),
            fenced: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> &dyn Producer {
        match self.hold.as_ref() {
            Some(Hold::Pooled {
                producer: Some(producer),
                ..
            }) => producer.as_ref(),
            Some(Hold::Shared { producer, .. }) => producer.as_ref().as_ref(),
            _ => unreachable!("producer held until release"),
        }
    }

    /// Whether a fence was observed on this producer
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    fn note_outcome(&self, result: &Result<()>) {
        if let Err(error) = result {
            if error.is_fenced() {
                self.fenced.store(true, Ordering::SeqCst);
            } else {
                self.poisoned.store(true, Ordering::SeqCst);
            }
        }
    }

    fn release(&mut self) {
        if let Some(hold) = self.hold.take() {
            if let Hold::Pooled {
                factory,
                suffix,
                mut producer,
            } = hold
            {
                let discard = self.fenced.load(Ordering::SeqCst)
                    || self.poisoned.load(Ordering::SeqCst);
                factory.release(suffix, producer.take(), discard);
            }
        }
    }
}

impl Producer for PooledProducer {
    fn begin_transaction(&self) -> Result<()> {
        let result = self.inner().begin_transaction();
        self.note_outcome(&result);
        result
    }

    fn send(&self, record: ProducerRecord) -> Result<SendFuture> {
        self.inner().send(record)
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        group_metadata: &ConsumerGroupMetadata,
    ) -> Result<()> {
        let result = self.inner().send_offsets_to_transaction(offsets, group_metadata);
        self.note_outcome(&result);
        result
    }

    fn commit_transaction(&self) -> Result<()> {
        let result = self.inner().commit_transaction();
        self.note_outcome(&result);
        result
    }

    fn abort_transaction(&self) -> Result<()> {
        let result = self.inner().abort_transaction();
        self.note_outcome(&result);
        result
    }

    fn flush(&self) -> Result<()> {
        self.inner().flush()
    }

    fn close(&self, _timeout: Duration) {
        // Returning to the pool is handled on drop; the physical close
        // belongs to the factory.
    }
}

impl Drop for PooledProducer {
    fn drop(&mut self) {
        self.release();
    }
}
