//! Listener dispatch
//!
//! The container family is one type parameterized by a dispatcher variant
//! rather than a hierarchy of subclasses. A listener advertises what it
//! needs through [`ListenerCapabilities`]; the container supplies exactly
//! those handles in the [`ListenerContext`].

use crate::client::{Consumer, ConsumerRecord};
use crate::container::ack::Acknowledgment;
use crate::container::seek::SeekHandle;
use crate::error::ListenerError;
use bytes::Bytes;
use std::time::Duration;

/// What a listener needs from the container, declared up front instead of
/// discovered reflectively
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerCapabilities {
    /// Receive an acknowledgment handle (manual ack modes)
    pub needs_ack: bool,

    /// Receive a reference to the consumer
    pub needs_consumer: bool,

    /// Receive a deferred-seek handle
    pub needs_seek_callback: bool,
}

/// Handles supplied to a listener for one dispatch
pub struct ListenerContext<'a> {
    /// The owning consumer, when the listener asked for it
    pub consumer: Option<&'a dyn Consumer>,

    /// Acknowledgment handle, under the manual ack modes
    pub ack: Option<Acknowledgment>,

    /// Deferred-seek handle, when the listener asked for it
    pub seeks: Option<SeekHandle>,

    /// Consumer group id of the owning container
    pub group_id: &'a str,
}

/// A single-record listener
pub trait RecordListener: Send {
    /// Handle one record; an error routes through the error-handler
    /// pipeline, never tears down the container
    fn on_record(
        &mut self,
        record: &ConsumerRecord,
        ctx: &mut ListenerContext<'_>,
    ) -> Result<(), ListenerError>;
}

/// Adapts a closure into a [`RecordListener`]
pub struct FnRecordListener<F>(F);

impl<F> RecordListener for FnRecordListener<F>
where
    F: FnMut(&ConsumerRecord, &mut ListenerContext<'_>) -> Result<(), ListenerError> + Send,
{
    fn on_record(
        &mut self,
        record: &ConsumerRecord,
        ctx: &mut ListenerContext<'_>,
    ) -> Result<(), ListenerError> {
        (self.0)(record, ctx)
    }
}

/// A whole-batch listener
pub trait BatchListener: Send {
    /// Handle one poll batch (or one per-partition sub-batch)
    fn on_batch(
        &mut self,
        records: &[ConsumerRecord],
        ctx: &mut ListenerContext<'_>,
    ) -> Result<(), ListenerError>;
}

/// Adapts a closure into a [`BatchListener`]
pub struct FnBatchListener<F>(F);

impl<F> BatchListener for FnBatchListener<F>
where
    F: FnMut(&[ConsumerRecord], &mut ListenerContext<'_>) -> Result<(), ListenerError> + Send,
{
    fn on_batch(
        &mut self,
        records: &[ConsumerRecord],
        ctx: &mut ListenerContext<'_>,
    ) -> Result<(), ListenerError> {
        (self.0)(records, ctx)
    }
}

/// Completion side of a deferred dispatch
pub struct CompletionHandle {
    tx: crossbeam_channel::Sender<Result<(), ListenerError>>,
}

impl CompletionHandle {
    /// Report the outcome of the deferred work
    pub fn complete(self, outcome: Result<(), ListenerError>) {
        let _ = self.tx.send(outcome);
    }
}

/// Token returned by a deferred listener; the poll thread awaits it before
/// acking, preserving per-partition ordering
pub struct CompletionToken {
    rx: crossbeam_channel::Receiver<Result<(), ListenerError>>,
}

impl CompletionToken {
    /// Create a token plus its completion handle
    pub fn pending() -> (CompletionHandle, CompletionToken) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (CompletionHandle { tx }, CompletionToken { rx })
    }

    /// A token that is already resolved
    pub fn ready(outcome: Result<(), ListenerError>) -> Self {
        let (handle, token) = Self::pending();
        handle.complete(outcome);
        token
    }

    /// Wait for the outcome, up to `timeout`
    pub fn await_outcome(self, timeout: Duration) -> Result<(), ListenerError> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(_) => Err(ListenerError::new(
                "ListenerTimeout",
                format!("listener did not complete within {timeout:?}"),
            )),
        }
    }
}

/// A listener that finishes its work off the poll thread and reports
/// through a completion token
pub trait DeferredRecordListener: Send {
    /// Begin handling one record; the returned token resolves when the
    /// work finishes
    fn on_record(
        &mut self,
        record: &ConsumerRecord,
        ctx: &mut ListenerContext<'_>,
    ) -> CompletionToken;
}

/// The dispatch strategy for a container
pub enum DispatchVariant {
    /// One listener call per record
    Record(Box<dyn RecordListener>),

    /// One listener call per poll batch
    Batch(Box<dyn BatchListener>),

    /// One call per record; completion awaited with a timeout
    DeferredRecord(Box<dyn DeferredRecordListener>),
}

/// A listener plus its declared capabilities
pub struct MessageDispatcher {
    /// Dispatch strategy
    pub variant: DispatchVariant,

    /// Declared listener needs
    pub capabilities: ListenerCapabilities,
}

impl MessageDispatcher {
    /// A record listener with no extra capabilities
    pub fn record(listener: impl RecordListener + 'static) -> Self {
        Self {
            variant: DispatchVariant::Record(Box::new(listener)),
            capabilities: ListenerCapabilities::default(),
        }
    }

    /// A record listener from a closure
    pub fn record_fn<F>(listener: F) -> Self
    where
        F: FnMut(&ConsumerRecord, &mut ListenerContext<'_>) -> Result<(), ListenerError>
            + Send
            + 'static,
    {
        Self::record(FnRecordListener(listener))
    }

    /// A batch listener with no extra capabilities
    pub fn batch(listener: impl BatchListener + 'static) -> Self {
        Self {
            variant: DispatchVariant::Batch(Box::new(listener)),
            capabilities: ListenerCapabilities::default(),
        }
    }

    /// A batch listener from a closure
    pub fn batch_fn<F>(listener: F) -> Self
    where
        F: FnMut(&[ConsumerRecord], &mut ListenerContext<'_>) -> Result<(), ListenerError>
            + Send
            + 'static,
    {
        Self::batch(FnBatchListener(listener))
    }

    /// A deferred record listener with no extra capabilities
    pub fn deferred(listener: impl DeferredRecordListener + 'static) -> Self {
        Self {
            variant: DispatchVariant::DeferredRecord(Box::new(listener)),
            capabilities: ListenerCapabilities::default(),
        }
    }

    /// Declare the listener's capability set
    pub fn with_capabilities(mut self, capabilities: ListenerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether the variant dispatches whole batches
    pub fn is_batch(&self) -> bool {
        matches!(self.variant, DispatchVariant::Batch(_))
    }
}

/// Where one listener argument comes from.
///
/// The binding plan replaces reflective parameter matching: it is computed
/// once at container start and resolved per record with no lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentSource {
    /// The record value
    Payload,
    /// The record key
    Key,
    /// The source topic name
    Topic,
    /// The source partition number
    Partition,
    /// The record offset
    Offset,
    /// The record timestamp
    Timestamp,
    /// A header looked up by name (last occurrence wins)
    HeaderByName(String),
}

/// A resolved listener argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    /// Byte payload (value, key, or header); `None` when absent
    Bytes(Option<Bytes>),
    /// Topic name
    Text(String),
    /// Partition number
    Int(i32),
    /// Offset or timestamp
    Long(i64),
}

/// An ordered argument binding computed at container start
#[derive(Debug, Clone, Default)]
pub struct BindingPlan {
    sources: Vec<ArgumentSource>,
}

impl BindingPlan {
    /// Build a plan from argument sources in call order
    pub fn new(sources: Vec<ArgumentSource>) -> Self {
        Self { sources }
    }

    /// The argument sources in call order
    pub fn sources(&self) -> &[ArgumentSource] {
        &self.sources
    }

    /// Resolve the arguments for one record
    pub fn resolve(&self, record: &ConsumerRecord) -> Vec<ArgumentValue> {
        self.sources
            .iter()
            .map(|source| match source {
                ArgumentSource::Payload => ArgumentValue::Bytes(record.value.clone()),
                ArgumentSource::Key => ArgumentValue::Bytes(record.key.clone()),
                ArgumentSource::Topic => ArgumentValue::Text(record.topic.clone()),
                ArgumentSource::Partition => ArgumentValue::Int(record.partition),
                ArgumentSource::Offset => ArgumentValue::Long(record.offset),
                ArgumentSource::Timestamp => ArgumentValue::Long(record.timestamp),
                ArgumentSource::HeaderByName(name) => {
                    ArgumentValue::Bytes(record.header(name).map(|h| h.value.clone()))
                }
            })
            .collect()
    }
}

/// A record listener driven by a binding plan: the handler receives the
/// resolved argument tuple instead of the raw record, the way an endpoint
/// method with declared parameters would
pub struct BoundRecordListener {
    plan: BindingPlan,
    handler: Box<dyn FnMut(&[ArgumentValue]) -> Result<(), ListenerError> + Send>,
}

impl BoundRecordListener {
    /// Bind a handler function to an argument plan
    pub fn new(
        plan: BindingPlan,
        handler: impl FnMut(&[ArgumentValue]) -> Result<(), ListenerError> + Send + 'static,
    ) -> Self {
        Self {
            plan,
            handler: Box::new(handler),
        }
    }
}

impl RecordListener for BoundRecordListener {
    fn on_record(
        &mut self,
        record: &ConsumerRecord,
        _ctx: &mut ListenerContext<'_>,
    ) -> Result<(), ListenerError> {
        let args = self.plan.resolve(record);
        (self.handler)(&args)
    }
}

/// Hook around each record delivery
pub trait RecordInterceptor: Send + Sync {
    /// Inspect or replace the record before the listener; `None` skips it
    fn intercept(
        &self,
        record: &ConsumerRecord,
        consumer: &dyn Consumer,
    ) -> Option<ConsumerRecord> {
        let _ = consumer;
        Some(record.clone())
    }

    /// Called after the listener succeeded
    fn success(&self, record: &ConsumerRecord, consumer: &dyn Consumer) {
        let _ = (record, consumer);
    }

    /// Called after the listener failed
    fn failure(&self, record: &ConsumerRecord, error: &ListenerError, consumer: &dyn Consumer) {
        let _ = (record, error, consumer);
    }
}

/// Hook around each batch delivery
pub trait BatchInterceptor: Send + Sync {
    /// Inspect or replace the batch before the listener; `None` skips it
    fn intercept(
        &self,
        records: &[ConsumerRecord],
        consumer: &dyn Consumer,
    ) -> Option<Vec<ConsumerRecord>> {
        let _ = consumer;
        Some(records.to_vec())
    }

    /// Called after the listener succeeded
    fn success(&self, records: &[ConsumerRecord], consumer: &dyn Consumer) {
        let _ = (records, consumer);
    }

    /// Called after the listener failed
    fn failure(&self, records: &[ConsumerRecord], error: &ListenerError, consumer: &dyn Consumer) {
        let _ = (records, error, consumer);
    }
}

/// Invokes delegates in registration order; the record from one intercept
/// feeds the next, and any `None` stops the chain
pub struct CompositeRecordInterceptor {
    delegates: Vec<Box<dyn RecordInterceptor>>,
}

impl CompositeRecordInterceptor {
    /// Compose interceptors in invocation order
    pub fn new(delegates: Vec<Box<dyn RecordInterceptor>>) -> Self {
        Self { delegates }
    }
}

impl RecordInterceptor for CompositeRecordInterceptor {
    fn intercept(
        &self,
        record: &ConsumerRecord,
        consumer: &dyn Consumer,
    ) -> Option<ConsumerRecord> {
        let mut current = record.clone();
        for delegate in &self.delegates {
            current = delegate.intercept(&current, consumer)?;
        }
        Some(current)
    }

    fn success(&self, record: &ConsumerRecord, consumer: &dyn Consumer) {
        for delegate in &self.delegates {
            delegate.success(record, consumer);
        }
    }

    fn failure(&self, record: &ConsumerRecord, error: &ListenerError, consumer: &dyn Consumer) {
        for delegate in &self.delegates {
            delegate.failure(record, error, consumer);
        }
    }
}

/// Invokes batch delegates in registration order; the records from one
/// intercept feed the next, and any `None` stops the chain
pub struct CompositeBatchInterceptor {
    delegates: Vec<Box<dyn BatchInterceptor>>,
}

impl CompositeBatchInterceptor {
    /// Compose interceptors in invocation order
    pub fn new(delegates: Vec<Box<dyn BatchInterceptor>>) -> Self {
        Self { delegates }
    }
}

impl BatchInterceptor for CompositeBatchInterceptor {
    fn intercept(
        &self,
        records: &[ConsumerRecord],
        consumer: &dyn Consumer,
    ) -> Option<Vec<ConsumerRecord>> {
        let mut current = records.to_vec();
        for delegate in &self.delegates {
            current = delegate.intercept(&current, consumer)?;
        }
        Some(current)
    }

    fn success(&self, records: &[ConsumerRecord], consumer: &dyn Consumer) {
        for delegate in &self.delegates {
            delegate.success(records, consumer);
        }
    }

    fn failure(&self, records: &[ConsumerRecord], error: &ListenerError, consumer: &dyn Consumer) {
        for delegate in &self.delegates {
            delegate.failure(records, error, consumer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Header;

    fn record() -> ConsumerRecord {
        ConsumerRecord::new(
            "orders",
            2,
            17,
            Some(Bytes::from_static(b"key")),
            Some(Bytes::from_static(b"value")),
        )
        .with_timestamp(1_700_000_000_000)
        .with_headers(vec![Header::new("trace", Bytes::from_static(b"abc"))])
    }

    #[test]
    fn test_binding_plan_resolution() {
        let plan = BindingPlan::new(vec![
            ArgumentSource::Payload,
            ArgumentSource::Key,
            ArgumentSource::Topic,
            ArgumentSource::Partition,
            ArgumentSource::Offset,
            ArgumentSource::HeaderByName("trace".into()),
            ArgumentSource::HeaderByName("missing".into()),
        ]);

        let args = plan.resolve(&record());
        assert_eq!(args.len(), 7);
        assert_eq!(
            args[0],
            ArgumentValue::Bytes(Some(Bytes::from_static(b"value")))
        );
        assert_eq!(args[2], ArgumentValue::Text("orders".into()));
        assert_eq!(args[3], ArgumentValue::Int(2));
        assert_eq!(args[4], ArgumentValue::Long(17));
        assert_eq!(
            args[5],
            ArgumentValue::Bytes(Some(Bytes::from_static(b"abc")))
        );
        assert_eq!(args[6], ArgumentValue::Bytes(None));
    }

    #[test]
    fn test_completion_token_ready_and_timeout() {
        let token = CompletionToken::ready(Ok(()));
        assert!(token.await_outcome(Duration::from_millis(5)).is_ok());

        let (_handle, token) = CompletionToken::pending();
        let outcome = token.await_outcome(Duration::from_millis(5));
        assert_eq!(outcome.unwrap_err().class(), "ListenerTimeout");
    }

    #[test]
    fn test_bound_listener_receives_resolved_arguments() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut listener = BoundRecordListener::new(
            BindingPlan::new(vec![ArgumentSource::Payload, ArgumentSource::Offset]),
            move |args: &[ArgumentValue]| {
                seen_clone.lock().extend_from_slice(args);
                Ok(())
            },
        );

        let mut ctx = ListenerContext {
            consumer: None,
            ack: None,
            seeks: None,
            group_id: "g1",
        };
        listener.on_record(&record(), &mut ctx).unwrap();

        let args = seen.lock().clone();
        assert_eq!(
            args,
            vec![
                ArgumentValue::Bytes(Some(Bytes::from_static(b"value"))),
                ArgumentValue::Long(17),
            ]
        );
    }

    #[test]
    fn test_dispatcher_capabilities() {
        let dispatcher = MessageDispatcher::record_fn(
            |_record: &ConsumerRecord, _ctx: &mut ListenerContext<'_>| Ok(()),
        )
        .with_capabilities(ListenerCapabilities {
            needs_ack: true,
            needs_consumer: false,
            needs_seek_callback: true,
        });

        assert!(dispatcher.capabilities.needs_ack);
        assert!(dispatcher.capabilities.needs_seek_callback);
        assert!(!dispatcher.is_batch());
    }
}
