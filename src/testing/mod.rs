//! Scripted in-memory mocks for container tests
//!
//! [`MockConsumer`] keeps per-partition logs and honest positions, so seeks
//! and pauses behave like the real client; [`MockProducer`] records every
//! transactional call. Both can share a [`CallTrace`] for cross-mock
//! ordering assertions, and both record their call history for
//! verification.

use crate::client::{
    CommitCallback, Consumer, ConsumerFactory, ConsumerGroupMetadata, ConsumerRecord,
    ConsumerWaker, Header, OffsetAndMetadata, OffsetMap, OffsetResetPolicy, Producer,
    ProducerRecord, RawProducerFactory, RebalanceHandler, RecordBatch, RecordMetadata,
    SendFuture, TopicPartition, TopicSelection,
};
use crate::error::{ConveyorError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared, ordered record of calls across several mocks
#[derive(Clone, Default)]
pub struct CallTrace {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallTrace {
    /// An empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Snapshot of the entries so far
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Assert that `expected` appears as a (not necessarily contiguous)
    /// subsequence of the trace
    pub fn assert_subsequence(&self, expected: &[&str]) {
        let entries = self.entries();
        let mut position = 0;
        for needle in expected {
            match entries[position..].iter().position(|e| e == needle) {
                Some(found) => position += found + 1,
                None => panic!(
                    "expected trace entry {needle:?} (in order) not found; trace: {entries:#?}"
                ),
            }
        }
    }
}

/// A consumer call recorded for assertions
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerCall {
    /// `subscribe` with topic names (or the pattern)
    Subscribe(Vec<String>),
    /// `assign` with explicit partitions
    Assign(Vec<TopicPartition>),
    /// One `poll` invocation
    Poll,
    /// Synchronous commit with its offsets
    CommitSync(OffsetMap),
    /// Asynchronous commit with its offsets
    CommitAsync(OffsetMap),
    /// A seek to an absolute offset
    Seek(TopicPartition, i64),
    /// Seek to the earliest offsets
    SeekToBeginning(Vec<TopicPartition>),
    /// Seek to the log end
    SeekToEnd(Vec<TopicPartition>),
    /// Client-side fetch pause
    Pause(Vec<TopicPartition>),
    /// Client-side fetch resume
    Resume(Vec<TopicPartition>),
    /// Committed-offset lookup
    Committed(Vec<TopicPartition>),
    /// Consumer close
    Close,
}

enum ScriptedPollError {
    Wakeup,
    Auth(String),
    Transient(String),
    Fatal(String),
}

#[derive(Default)]
struct MockConsumerState {
    logs: BTreeMap<TopicPartition, Vec<ConsumerRecord>>,
    positions: HashMap<TopicPartition, i64>,
    committed: HashMap<TopicPartition, OffsetAndMetadata>,
    assigned: Vec<TopicPartition>,
    paused: Vec<TopicPartition>,
    pending_assignments: VecDeque<Vec<TopicPartition>>,
    pending_revokes: VecDeque<Vec<TopicPartition>>,
    pending_lost: VecDeque<Vec<TopicPartition>>,
    poll_errors: VecDeque<ScriptedPollError>,
    commit_failures: u32,
    calls: Vec<ConsumerCall>,
    closed: bool,
}

struct MockConsumerInner {
    state: Mutex<MockConsumerState>,
    woken: AtomicBool,
    group_id: String,
    reset_policy: Mutex<OffsetResetPolicy>,
    trace: Mutex<Option<CallTrace>>,
}

/// In-memory consumer with per-partition logs and scripted rebalances.
///
/// Cloning shares the underlying state, so tests keep a clone to script
/// and inspect while the container owns another.
#[derive(Clone)]
pub struct MockConsumer {
    inner: Arc<MockConsumerInner>,
}

struct MockWaker {
    woken: Arc<MockConsumerInner>,
}

impl ConsumerWaker for MockWaker {
    fn wakeup(&self) {
        self.woken.woken.store(true, Ordering::SeqCst);
    }
}

impl MockConsumer {
    /// A consumer for the given group with a `latest` reset policy
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MockConsumerInner {
                state: Mutex::new(MockConsumerState::default()),
                woken: AtomicBool::new(false),
                group_id: group_id.into(),
                reset_policy: Mutex::new(OffsetResetPolicy::Latest),
                trace: Mutex::new(None),
            }),
        }
    }

    /// Report the given reset policy
    pub fn with_reset_policy(self, policy: OffsetResetPolicy) -> Self {
        *self.inner.reset_policy.lock() = policy;
        self
    }

    /// Share a cross-mock call trace
    pub fn with_trace(self, trace: CallTrace) -> Self {
        *self.inner.trace.lock() = Some(trace);
        self
    }

    fn trace(&self, entry: impl Into<String>) {
        if let Some(trace) = self.inner.trace.lock().as_ref() {
            trace.record(entry);
        }
    }

    /// Append a record to a partition log; returns its offset
    pub fn produce(
        &self,
        tp: &TopicPartition,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Vec<Header>,
    ) -> i64 {
        let mut state = self.inner.state.lock();
        let log = state.logs.entry(tp.clone()).or_default();
        let offset = log.len() as i64;
        log.push(
            ConsumerRecord::new(tp.topic.clone(), tp.partition, offset, key, value)
                .with_timestamp(offset)
                .with_headers(headers),
        );
        offset
    }

    /// Append a record with a specific timestamp
    pub fn produce_with_timestamp(
        &self,
        tp: &TopicPartition,
        value: Option<Bytes>,
        headers: Vec<Header>,
        timestamp: i64,
    ) -> i64 {
        let mut state = self.inner.state.lock();
        let log = state.logs.entry(tp.clone()).or_default();
        let offset = log.len() as i64;
        log.push(
            ConsumerRecord::new(tp.topic.clone(), tp.partition, offset, None, value)
                .with_timestamp(timestamp)
                .with_headers(headers),
        );
        offset
    }

    /// Pre-set a committed offset (as left by a previous consumer)
    pub fn set_committed(&self, tp: &TopicPartition, offset: i64) {
        self.inner
            .state
            .lock()
            .committed
            .insert(tp.clone(), OffsetAndMetadata::new(offset));
    }

    /// Fire an assignment callback on the next poll
    pub fn schedule_assignment(&self, partitions: Vec<TopicPartition>) {
        self.inner
            .state
            .lock()
            .pending_assignments
            .push_back(partitions);
    }

    /// Fire a cooperative revocation callback on the next poll
    pub fn schedule_revoke(&self, partitions: Vec<TopicPartition>) {
        self.inner.state.lock().pending_revokes.push_back(partitions);
    }

    /// Fire a lost-partitions callback on the next poll
    pub fn schedule_lost(&self, partitions: Vec<TopicPartition>) {
        self.inner.state.lock().pending_lost.push_back(partitions);
    }

    /// Fail the next poll with a wakeup
    pub fn schedule_wakeup_error(&self) {
        self.inner
            .state
            .lock()
            .poll_errors
            .push_back(ScriptedPollError::Wakeup);
    }

    /// Fail the next poll with an authentication error
    pub fn schedule_auth_error(&self, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .poll_errors
            .push_back(ScriptedPollError::Auth(message.into()));
    }

    /// Fail the next poll with a retriable broker error
    pub fn schedule_transient_error(&self, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .poll_errors
            .push_back(ScriptedPollError::Transient(message.into()));
    }

    /// Fail the next poll fatally
    pub fn schedule_fatal_error(&self, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .poll_errors
            .push_back(ScriptedPollError::Fatal(message.into()));
    }

    /// Fail the next `n` synchronous commits with a retriable error
    pub fn fail_commits(&self, n: u32) {
        self.inner.state.lock().commit_failures = n;
    }

    /// Every call recorded so far
    pub fn calls(&self) -> Vec<ConsumerCall> {
        self.inner.state.lock().calls.clone()
    }

    /// Committed offset for a partition, if any
    pub fn committed_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(tp)
            .map(|c| c.offset)
    }

    /// Partitions currently paused at the client
    pub fn paused_partitions(&self) -> Vec<TopicPartition> {
        self.inner.state.lock().paused.clone()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of polls so far
    pub fn poll_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, ConsumerCall::Poll))
            .count()
    }

    fn record_call(&self, call: ConsumerCall) {
        self.inner.state.lock().calls.push(call);
    }

    fn available_records(&self) -> Vec<ConsumerRecord> {
        let mut state = self.inner.state.lock();
        let mut out = Vec::new();
        let assigned = state.assigned.clone();
        for tp in assigned {
            if state.paused.contains(&tp) {
                continue;
            }
            let position = state.positions.get(&tp).copied().unwrap_or_else(|| {
                // No position yet; apply the reset policy.
                match *self.inner.reset_policy.lock() {
                    OffsetResetPolicy::Latest => state
                        .committed
                        .get(&tp)
                        .map(|c| c.offset)
                        .unwrap_or_else(|| {
                            state.logs.get(&tp).map(|l| l.len() as i64).unwrap_or(0)
                        }),
                    _ => state.committed.get(&tp).map(|c| c.offset).unwrap_or(0),
                }
            });
            let log_len = state.logs.get(&tp).map(|l| l.len() as i64).unwrap_or(0);
            if position < log_len {
                if let Some(log) = state.logs.get(&tp) {
                    for record in &log[position as usize..] {
                        out.push(record.clone());
                    }
                }
                state.positions.insert(tp, log_len);
            } else {
                state.positions.entry(tp).or_insert(position);
            }
        }
        out
    }
}

impl Consumer for MockConsumer {
    fn subscribe(&self, selection: &TopicSelection) -> Result<()> {
        let names = match selection {
            TopicSelection::Names(names) => names.clone(),
            TopicSelection::Pattern(pattern) => vec![pattern.clone()],
            TopicSelection::Partitions(_) => {
                return Err(ConveyorError::Config(
                    "explicit partitions use assign".to_string(),
                ))
            }
        };
        self.record_call(ConsumerCall::Subscribe(names));
        self.trace("consumer.subscribe");
        Ok(())
    }

    fn assign(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.record_call(ConsumerCall::Assign(partitions.to_vec()));
        self.trace("consumer.assign");
        self.inner.state.lock().assigned = partitions.to_vec();
        Ok(())
    }

    fn poll(
        &self,
        timeout: Duration,
        rebalance: &mut dyn RebalanceHandler,
    ) -> Result<RecordBatch> {
        self.record_call(ConsumerCall::Poll);
        self.trace("consumer.poll");

        // Scripted rebalances fire on the poll thread, before records.
        loop {
            let revoked = self.inner.state.lock().pending_revokes.pop_front();
            match revoked {
                Some(partitions) => {
                    rebalance.on_partitions_revoked(self, &partitions);
                    let mut state = self.inner.state.lock();
                    state.assigned.retain(|tp| !partitions.contains(tp));
                    state.paused.retain(|tp| !partitions.contains(tp));
                }
                None => break,
            }
        }
        loop {
            let lost = self.inner.state.lock().pending_lost.pop_front();
            match lost {
                Some(partitions) => {
                    rebalance.on_partitions_lost(self, &partitions);
                    let mut state = self.inner.state.lock();
                    state.assigned.retain(|tp| !partitions.contains(tp));
                    state.paused.retain(|tp| !partitions.contains(tp));
                }
                None => break,
            }
        }
        loop {
            let assigned = self.inner.state.lock().pending_assignments.pop_front();
            match assigned {
                Some(partitions) => {
                    {
                        let mut state = self.inner.state.lock();
                        for tp in &partitions {
                            if !state.assigned.contains(tp) {
                                state.assigned.push(tp.clone());
                            }
                        }
                    }
                    rebalance
                        .on_partitions_assigned(self, &partitions)
                        .map_err(|e| ConveyorError::Rebalance(e.to_string()))?;
                }
                None => break,
            }
        }

        if let Some(error) = self.inner.state.lock().poll_errors.pop_front() {
            return Err(match error {
                ScriptedPollError::Wakeup => ConveyorError::Wakeup,
                ScriptedPollError::Auth(m) => ConveyorError::AuthenticationFailed(m),
                ScriptedPollError::Transient(m) => ConveyorError::TransientBroker(m),
                ScriptedPollError::Fatal(m) => ConveyorError::IllegalState(m),
            });
        }

        // Block (in small slices, watching the waker) until data or timeout.
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.woken.swap(false, Ordering::SeqCst) {
                return Err(ConveyorError::Wakeup);
            }
            let records = self.available_records();
            if !records.is_empty() {
                return Ok(RecordBatch::from_records(records));
            }
            if Instant::now() >= deadline {
                return Ok(RecordBatch::empty());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn commit_sync(&self, offsets: &OffsetMap, _timeout: Duration) -> Result<()> {
        self.record_call(ConsumerCall::CommitSync(offsets.clone()));
        let mut state = self.inner.state.lock();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(ConveyorError::TransientBroker(
                "commit coordinator unavailable".to_string(),
            ));
        }
        for (tp, offset) in offsets {
            state.committed.insert(tp.clone(), offset.clone());
        }
        drop(state);
        for (tp, offset) in offsets {
            self.trace(format!("consumer.commit {} -> {}", tp, offset.offset));
        }
        Ok(())
    }

    fn commit_async(&self, offsets: &OffsetMap, callback: CommitCallback) -> Result<()> {
        self.record_call(ConsumerCall::CommitAsync(offsets.clone()));
        let mut state = self.inner.state.lock();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            drop(state);
            callback(
                offsets,
                Some(&ConveyorError::TransientBroker(
                    "commit coordinator unavailable".to_string(),
                )),
            );
            return Ok(());
        }
        for (tp, offset) in offsets {
            state.committed.insert(tp.clone(), offset.clone());
        }
        drop(state);
        callback(offsets, None);
        Ok(())
    }

    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.record_call(ConsumerCall::Seek(tp.clone(), offset));
        self.trace(format!("consumer.seek {} -> {}", tp, offset));
        self.inner.state.lock().positions.insert(tp.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.record_call(ConsumerCall::SeekToBeginning(partitions.to_vec()));
        let mut state = self.inner.state.lock();
        for tp in partitions {
            state.positions.insert(tp.clone(), 0);
        }
        Ok(())
    }

    fn seek_to_end(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.record_call(ConsumerCall::SeekToEnd(partitions.to_vec()));
        let mut state = self.inner.state.lock();
        for tp in partitions {
            let end = state.logs.get(tp).map(|l| l.len() as i64).unwrap_or(0);
            state.positions.insert(tp.clone(), end);
        }
        Ok(())
    }

    fn offsets_for_times(
        &self,
        query: &HashMap<TopicPartition, i64>,
    ) -> Result<HashMap<TopicPartition, Option<i64>>> {
        let state = self.inner.state.lock();
        let mut out = HashMap::new();
        for (tp, timestamp) in query {
            let found = state.logs.get(tp).and_then(|log| {
                log.iter()
                    .find(|record| record.timestamp >= *timestamp)
                    .map(|record| record.offset)
            });
            out.insert(tp.clone(), found);
        }
        Ok(out)
    }

    fn beginning_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        Ok(partitions.iter().map(|tp| (tp.clone(), 0)).collect())
    }

    fn end_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        let state = self.inner.state.lock();
        Ok(partitions
            .iter()
            .map(|tp| {
                let end = state.logs.get(tp).map(|l| l.len() as i64).unwrap_or(0);
                (tp.clone(), end)
            })
            .collect())
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.record_call(ConsumerCall::Pause(partitions.to_vec()));
        let mut state = self.inner.state.lock();
        for tp in partitions {
            if !state.paused.contains(tp) {
                state.paused.push(tp.clone());
            }
        }
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.record_call(ConsumerCall::Resume(partitions.to_vec()));
        self.inner
            .state
            .lock()
            .paused
            .retain(|tp| !partitions.contains(tp));
        Ok(())
    }

    fn paused(&self) -> Result<Vec<TopicPartition>> {
        Ok(self.inner.state.lock().paused.clone())
    }

    fn position(&self, tp: &TopicPartition) -> Result<i64> {
        let state = self.inner.state.lock();
        let position = state.positions.get(tp).copied().unwrap_or_else(|| {
            match *self.inner.reset_policy.lock() {
                OffsetResetPolicy::Latest => {
                    state.logs.get(tp).map(|l| l.len() as i64).unwrap_or(0)
                }
                _ => 0,
            }
        });
        Ok(position)
    }

    fn committed(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, Option<OffsetAndMetadata>>> {
        self.record_call(ConsumerCall::Committed(partitions.to_vec()));
        let state = self.inner.state.lock();
        Ok(partitions
            .iter()
            .map(|tp| (tp.clone(), state.committed.get(tp).cloned()))
            .collect())
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>> {
        Ok(self.inner.state.lock().assigned.clone())
    }

    fn reset_policy(&self) -> OffsetResetPolicy {
        *self.inner.reset_policy.lock()
    }

    fn group_metadata(&self) -> ConsumerGroupMetadata {
        ConsumerGroupMetadata {
            group_id: self.inner.group_id.clone(),
            generation_id: 1,
            member_id: "mock-member-1".to_string(),
            group_instance_id: None,
        }
    }

    fn waker(&self) -> Arc<dyn ConsumerWaker> {
        Arc::new(MockWaker {
            woken: self.inner.clone(),
        })
    }

    fn close(&self, _timeout: Duration) -> Result<()> {
        self.record_call(ConsumerCall::Close);
        self.trace("consumer.close");
        self.inner.state.lock().closed = true;
        Ok(())
    }
}

/// A factory call recorded by [`MockConsumerFactory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerCreation {
    /// Consumer group id
    pub group_id: String,
    /// Composed client id prefix
    pub client_id_prefix: String,
    /// Composed client id suffix
    pub client_id_suffix: String,
}

/// Hands out pre-scripted [`MockConsumer`]s in order
pub struct MockConsumerFactory {
    consumers: Mutex<VecDeque<MockConsumer>>,
    creations: Mutex<Vec<ConsumerCreation>>,
    fail_next: Mutex<Option<String>>,
}

impl MockConsumerFactory {
    /// A factory that hands out the given consumers in order
    pub fn new(consumers: Vec<MockConsumer>) -> Self {
        Self {
            consumers: Mutex::new(consumers.into()),
            creations: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// A factory with one scripted consumer
    pub fn single(consumer: MockConsumer) -> Self {
        Self::new(vec![consumer])
    }

    /// Fail the next creation with the given reason
    pub fn fail_next_creation(&self, reason: impl Into<String>) {
        *self.fail_next.lock() = Some(reason.into());
    }

    /// Creations recorded so far
    pub fn creations(&self) -> Vec<ConsumerCreation> {
        self.creations.lock().clone()
    }
}

impl ConsumerFactory for MockConsumerFactory {
    fn create(
        &self,
        group_id: &str,
        client_id_prefix: &str,
        client_id_suffix: &str,
        _overrides: &HashMap<String, String>,
    ) -> Result<Box<dyn Consumer>> {
        self.creations.lock().push(ConsumerCreation {
            group_id: group_id.to_string(),
            client_id_prefix: client_id_prefix.to_string(),
            client_id_suffix: client_id_suffix.to_string(),
        });
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(ConveyorError::ConsumerCreation(reason));
        }
        self.consumers
            .lock()
            .pop_front()
            .map(|consumer| Box::new(consumer) as Box<dyn Consumer>)
            .ok_or_else(|| {
                ConveyorError::ConsumerCreation("no scripted consumer left".to_string())
            })
    }
}

/// A producer call recorded for assertions
#[derive(Debug, Clone)]
pub enum ProducerCall {
    /// `begin_transaction`
    BeginTx,
    /// A published record
    Send(ProducerRecord),
    /// Offsets added to the current transaction
    SendOffsets(OffsetMap, String),
    /// `commit_transaction`
    CommitTx,
    /// `abort_transaction`
    AbortTx,
    /// `flush`
    Flush,
    /// `close`
    Close,
}

#[derive(Default)]
struct MockProducerState {
    calls: Vec<ProducerCall>,
    next_offsets: HashMap<String, i64>,
    fail_sends: u32,
    fence_commits: u32,
    closed: bool,
}

/// Records every producer call; sends succeed immediately unless scripted
/// otherwise
#[derive(Clone, Default)]
pub struct MockProducer {
    state: Arc<Mutex<MockProducerState>>,
    trace: Arc<Mutex<Option<CallTrace>>>,
}

impl MockProducer {
    /// A fresh producer
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a cross-mock call trace
    pub fn with_trace(self, trace: CallTrace) -> Self {
        *self.trace.lock() = Some(trace);
        self
    }

    fn trace_entry(&self, entry: impl Into<String>) {
        if let Some(trace) = self.trace.lock().as_ref() {
            trace.record(entry);
        }
    }

    /// Fail the next `n` sends
    pub fn fail_sends(&self, n: u32) {
        self.state.lock().fail_sends = n;
    }

    /// Fence the next `n` transactional commits
    pub fn fence_commits(&self, n: u32) {
        self.state.lock().fence_commits = n;
    }

    /// Every call recorded so far
    pub fn calls(&self) -> Vec<ProducerCall> {
        self.state.lock().calls.clone()
    }

    /// The records published so far
    pub fn sent_records(&self) -> Vec<ProducerRecord> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProducerCall::Send(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Producer for MockProducer {
    fn begin_transaction(&self) -> Result<()> {
        self.state.lock().calls.push(ProducerCall::BeginTx);
        self.trace_entry("producer.begin");
        Ok(())
    }

    fn send(&self, record: ProducerRecord) -> Result<SendFuture> {
        let mut state = self.state.lock();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Ok(SendFuture::completed(Err(ConveyorError::SendFailed(
                "scripted send failure".to_string(),
            ))));
        }
        let topic = record.topic.clone();
        let partition = record.partition.unwrap_or(0);
        let offset = state.next_offsets.entry(topic.clone()).or_insert(0);
        let assigned = *offset;
        *offset += 1;
        state.calls.push(ProducerCall::Send(record));
        drop(state);
        self.trace_entry(format!("producer.send {topic}"));
        Ok(SendFuture::completed(Ok(RecordMetadata {
            topic,
            partition,
            offset: assigned,
        })))
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        group_metadata: &ConsumerGroupMetadata,
    ) -> Result<()> {
        self.state.lock().calls.push(ProducerCall::SendOffsets(
            offsets.clone(),
            group_metadata.group_id.clone(),
        ));
        for (tp, offset) in offsets {
            self.trace_entry(format!("producer.sendOffsets {} -> {}", tp, offset.offset));
        }
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ProducerCall::CommitTx);
        if state.fence_commits > 0 {
            state.fence_commits -= 1;
            drop(state);
            self.trace_entry("producer.commit FENCED");
            return Err(ConveyorError::ProducerFenced("newer epoch active".to_string()));
        }
        drop(state);
        self.trace_entry("producer.commit");
        Ok(())
    }

    fn abort_transaction(&self) -> Result<()> {
        self.state.lock().calls.push(ProducerCall::AbortTx);
        self.trace_entry("producer.abort");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.state.lock().calls.push(ProducerCall::Flush);
        Ok(())
    }

    fn close(&self, _timeout: Duration) {
        let mut state = self.state.lock();
        state.calls.push(ProducerCall::Close);
        state.closed = true;
    }
}

/// Raw factory over a single shared [`MockProducer`]; records the
/// transactional ids it was asked for
pub struct MockProducerFactory {
    producer: MockProducer,
    transactional_ids: Mutex<Vec<Option<String>>>,
}

impl MockProducerFactory {
    /// A factory handing out clones of the given producer
    pub fn new(producer: MockProducer) -> Self {
        Self {
            producer,
            transactional_ids: Mutex::new(Vec::new()),
        }
    }

    /// The transactional ids requested so far
    pub fn transactional_ids(&self) -> Vec<Option<String>> {
        self.transactional_ids.lock().clone()
    }
}

impl RawProducerFactory for MockProducerFactory {
    fn create_raw(&self, transactional_id: Option<&str>) -> Result<Box<dyn Producer>> {
        self.transactional_ids
            .lock()
            .push(transactional_id.map(|s| s.to_string()));
        Ok(Box::new(self.producer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::OffsetMap;

    struct NoopRebalance;

    impl RebalanceHandler for NoopRebalance {
        fn on_partitions_assigned(
            &mut self,
            _consumer: &dyn Consumer,
            _partitions: &[TopicPartition],
        ) -> Result<()> {
            Ok(())
        }

        fn on_partitions_revoked(
            &mut self,
            _consumer: &dyn Consumer,
            _partitions: &[TopicPartition],
        ) {
        }

        fn on_partitions_lost(
            &mut self,
            _consumer: &dyn Consumer,
            _partitions: &[TopicPartition],
        ) {
        }
    }

    #[test]
    fn test_poll_returns_produced_records_in_partition_order() {
        let consumer = MockConsumer::new("group-1").with_reset_policy(OffsetResetPolicy::Earliest);
        let tp0 = TopicPartition::new("foo", 0);
        let tp1 = TopicPartition::new("foo", 1);
        consumer.assign(&[tp0.clone(), tp1.clone()]).unwrap();
        consumer.produce(&tp1, None, Some(Bytes::from_static(b"b")), vec![]);
        consumer.produce(&tp0, None, Some(Bytes::from_static(b"a")), vec![]);

        let batch = consumer
            .poll(Duration::from_millis(10), &mut NoopRebalance)
            .unwrap();
        let values: Vec<&[u8]> = batch
            .records()
            .iter()
            .map(|r| r.value.as_deref().unwrap_or(b""))
            .collect();
        assert_eq!(values, vec![b"a".as_ref(), b"b".as_ref()]);

        // Everything consumed; the next poll is empty.
        let batch = consumer
            .poll(Duration::from_millis(5), &mut NoopRebalance)
            .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_seek_rewinds_the_log() {
        let consumer = MockConsumer::new("group-1").with_reset_policy(OffsetResetPolicy::Earliest);
        let tp = TopicPartition::new("foo", 0);
        consumer.assign(&[tp.clone()]).unwrap();
        consumer.produce(&tp, None, Some(Bytes::from_static(b"a")), vec![]);
        consumer.produce(&tp, None, Some(Bytes::from_static(b"b")), vec![]);

        let first = consumer
            .poll(Duration::from_millis(10), &mut NoopRebalance)
            .unwrap();
        assert_eq!(first.count(), 2);

        consumer.seek(&tp, 1).unwrap();
        let second = consumer
            .poll(Duration::from_millis(10), &mut NoopRebalance)
            .unwrap();
        assert_eq!(second.count(), 1);
        assert_eq!(second.records()[0].offset, 1);
    }

    #[test]
    fn test_paused_partitions_yield_nothing() {
        let consumer = MockConsumer::new("group-1").with_reset_policy(OffsetResetPolicy::Earliest);
        let tp = TopicPartition::new("foo", 0);
        consumer.assign(&[tp.clone()]).unwrap();
        consumer.produce(&tp, None, Some(Bytes::from_static(b"a")), vec![]);

        consumer.pause(&[tp.clone()]).unwrap();
        let batch = consumer
            .poll(Duration::from_millis(5), &mut NoopRebalance)
            .unwrap();
        assert!(batch.is_empty());

        consumer.resume(&[tp]).unwrap();
        let batch = consumer
            .poll(Duration::from_millis(10), &mut NoopRebalance)
            .unwrap();
        assert_eq!(batch.count(), 1);
    }

    #[test]
    fn test_wakeup_interrupts_poll() {
        let consumer = MockConsumer::new("group-1");
        let waker = consumer.waker();
        waker.wakeup();
        let result = consumer.poll(Duration::from_secs(5), &mut NoopRebalance);
        assert!(matches!(result, Err(ConveyorError::Wakeup)));
    }

    #[test]
    fn test_commit_failures_are_scripted() {
        let consumer = MockConsumer::new("group-1");
        consumer.fail_commits(1);
        let mut offsets = OffsetMap::new();
        offsets.insert(TopicPartition::new("foo", 0), OffsetAndMetadata::new(1));

        assert!(consumer
            .commit_sync(&offsets, Duration::from_secs(1))
            .is_err());
        assert!(consumer
            .commit_sync(&offsets, Duration::from_secs(1))
            .is_ok());
        assert_eq!(
            consumer.committed_offset(&TopicPartition::new("foo", 0)),
            Some(1)
        );
    }

    #[test]
    fn test_mock_producer_records_transaction_calls() {
        let producer = MockProducer::new();
        producer.begin_transaction().unwrap();
        let future = producer
            .send(ProducerRecord::new(
                "orders-dlt",
                None,
                Some(Bytes::from_static(b"x")),
            ))
            .unwrap();
        assert_eq!(future.get(Duration::from_millis(10)).unwrap().offset, 0);
        producer.commit_transaction().unwrap();

        let calls = producer.calls();
        assert!(matches!(calls[0], ProducerCall::BeginTx));
        assert!(matches!(calls[1], ProducerCall::Send(_)));
        assert!(matches!(calls[2], ProducerCall::CommitTx));
    }

    #[test]
    fn test_call_trace_subsequence() {
        let trace = CallTrace::new();
        trace.record("a");
        trace.record("b");
        trace.record("c");
        trace.assert_subsequence(&["a", "c"]);
    }
}
