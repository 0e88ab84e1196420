//! Retry chain computation and destination resolution

use crate::config::EndpointDescriptor;
use crate::client::TopicSelection;
use crate::error::{ConveyorError, Result};
use crate::handler::{BackOffPolicy, BinaryErrorClassifier};
use crate::retry::{
    DestinationKind, DestinationProperties, DestinationTopic, DltStrategy,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How retry topic suffixes are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixStrategy {
    /// Append the delay value: `-retry-1000`. Constant backoff collapses
    /// the hops into one reusable `-retry` topic.
    DelayValue,
    /// Append the attempt ordinal: `-retry-0`, `-retry-1`
    Ordinal,
}

/// User declaration for one retry chain
#[derive(Debug, Clone)]
pub struct RetryTopicConfiguration {
    max_attempts: u32,
    backoff: BackOffPolicy,
    dlt_strategy: DltStrategy,
    classifier: BinaryErrorClassifier,
    timeout: Option<Duration>,
    retry_suffix: String,
    dlt_suffix: String,
    suffix_strategy: SuffixStrategy,
    num_partitions: i32,
    replicas: i16,
    matched_dlts: Vec<(HashSet<String>, String)>,
}

impl RetryTopicConfiguration {
    /// Default retry topic suffix
    pub const DEFAULT_RETRY_SUFFIX: &'static str = "-retry";

    /// Default dead-letter topic suffix
    pub const DEFAULT_DLT_SUFFIX: &'static str = "-dlt";

    /// Start building a retry chain declaration
    pub fn builder() -> RetryTopicConfigurationBuilder {
        RetryTopicConfigurationBuilder::new()
    }

    /// Retry delivery budget (hops after the first delivery)
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Destination properties for the chain, in order:
    /// main, retries, exception-matched DLTs, generic DLT (or a no-op
    /// terminal under [`DltStrategy::NoDlt`])
    pub fn destinations(&self) -> Vec<DestinationProperties> {
        let mut destinations = Vec::new();

        destinations.push(self.properties(0, String::new(), DestinationKind::Main, HashSet::new()));

        let delays = self.backoff.intervals(self.max_attempts);
        let reusable = self.suffix_strategy == SuffixStrategy::DelayValue
            && self.backoff.is_constant()
            && self.max_attempts > 1;

        if reusable {
            destinations.push(self.properties(
                delays.first().copied().unwrap_or(0),
                self.retry_suffix.clone(),
                DestinationKind::ReusableRetry,
                HashSet::new(),
            ));
        } else {
            for (index, delay) in delays.iter().enumerate() {
                let suffix = match self.suffix_strategy {
                    SuffixStrategy::DelayValue => format!("{}-{}", self.retry_suffix, delay),
                    SuffixStrategy::Ordinal => format!("{}-{}", self.retry_suffix, index),
                };
                destinations.push(self.properties(
                    *delay,
                    suffix,
                    DestinationKind::Retry,
                    HashSet::new(),
                ));
            }
        }

        match self.dlt_strategy {
            DltStrategy::NoDlt => {
                let last_retry_suffix = destinations
                    .last()
                    .map(|d| d.suffix.clone())
                    .unwrap_or_default();
                destinations.push(self.properties(
                    0,
                    format!("{last_retry_suffix}-noOps"),
                    DestinationKind::NoOps,
                    HashSet::new(),
                ));
            }
            _ => {
                for (classes, suffix) in &self.matched_dlts {
                    destinations.push(self.properties(
                        0,
                        suffix.clone(),
                        DestinationKind::Dlt,
                        classes.clone(),
                    ));
                }
                destinations.push(self.properties(
                    0,
                    self.dlt_suffix.clone(),
                    DestinationKind::Dlt,
                    HashSet::new(),
                ));
            }
        }

        destinations
    }

    /// The named chain for a main topic
    pub fn chain_for(&self, main_topic: &str) -> Vec<Arc<DestinationTopic>> {
        self.destinations()
            .into_iter()
            .map(|properties| {
                let name = format!("{}{}", main_topic, properties.suffix);
                Arc::new(DestinationTopic::new(name, properties))
            })
            .collect()
    }

    fn properties(
        &self,
        delay_ms: u64,
        suffix: String,
        kind: DestinationKind,
        matching: HashSet<String>,
    ) -> DestinationProperties {
        DestinationProperties {
            delay_ms,
            suffix,
            kind,
            num_partitions: self.num_partitions,
            replicas: self.replicas,
            dlt_strategy: self.dlt_strategy,
            max_retry_attempts: self.max_attempts,
            classifier: self.classifier.clone(),
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            producer_id: None,
            matching_error_classes: matching,
        }
    }
}

/// Builder for [`RetryTopicConfiguration`]
#[derive(Debug, Clone)]
pub struct RetryTopicConfigurationBuilder {
    configuration: RetryTopicConfiguration,
}

impl RetryTopicConfigurationBuilder {
    fn new() -> Self {
        Self {
            configuration: RetryTopicConfiguration {
                max_attempts: 3,
                backoff: BackOffPolicy::Fixed {
                    delay: Duration::from_secs(1),
                },
                dlt_strategy: DltStrategy::FailOnError,
                classifier: BinaryErrorClassifier::retry_all(),
                timeout: None,
                retry_suffix: RetryTopicConfiguration::DEFAULT_RETRY_SUFFIX.to_string(),
                dlt_suffix: RetryTopicConfiguration::DEFAULT_DLT_SUFFIX.to_string(),
                suffix_strategy: SuffixStrategy::DelayValue,
                num_partitions: 1,
                replicas: 1,
                matched_dlts: Vec::new(),
            },
        }
    }

    /// Set the retry delivery budget
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.configuration.max_attempts = max_attempts.max(1);
        self
    }

    /// The same delay for every hop
    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.configuration.backoff = BackOffPolicy::Fixed { delay };
        self
    }

    /// Geometrically growing delays
    pub fn exponential_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.configuration.backoff = BackOffPolicy::Exponential {
            initial,
            multiplier,
            max,
        };
        self
    }

    /// Set the dead-letter failure strategy
    pub fn dlt_strategy(mut self, strategy: DltStrategy) -> Self {
        self.configuration.dlt_strategy = strategy;
        self
    }

    /// Retry only the given error classes
    pub fn retry_on<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configuration.classifier = BinaryErrorClassifier::retry_on(classes);
        self
    }

    /// Retry everything except the given error classes
    pub fn no_retry_on<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configuration.classifier = BinaryErrorClassifier::no_retry_on(classes);
        self
    }

    /// Bound the total retry window from the original failure
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.configuration.timeout = Some(timeout);
        self
    }

    /// Override the retry topic suffix
    pub fn retry_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.configuration.retry_suffix = suffix.into();
        self
    }

    /// Override the dead-letter topic suffix
    pub fn dlt_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.configuration.dlt_suffix = suffix.into();
        self
    }

    /// Use ordinal suffixes instead of delay values
    pub fn suffix_strategy(mut self, strategy: SuffixStrategy) -> Self {
        self.configuration.suffix_strategy = strategy;
        self
    }

    /// Partitions and replicas for provisioned chain topics
    pub fn topic_shape(mut self, num_partitions: i32, replicas: i16) -> Self {
        self.configuration.num_partitions = num_partitions;
        self.configuration.replicas = replicas;
        self
    }

    /// Route the given error classes to a dedicated dead-letter topic
    pub fn dlt_for<I, S>(mut self, classes: I, suffix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configuration
            .matched_dlts
            .push((classes.into_iter().map(Into::into).collect(), suffix.into()));
        self
    }

    /// Freeze the declaration
    pub fn build(self) -> RetryTopicConfiguration {
        self.configuration
    }
}

type ChainRef = (Arc<Vec<Arc<DestinationTopic>>>, usize);

/// Maps every topic of every registered chain to its chain position and
/// answers "where does this failed record go next"
#[derive(Default)]
pub struct DestinationTopicResolver {
    by_topic: RwLock<HashMap<String, ChainRef>>,
    mains: RwLock<HashMap<String, Arc<Vec<Arc<DestinationTopic>>>>>,
}

impl DestinationTopicResolver {
    /// An empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the chain for a main topic, replacing any previous one
    pub fn register(
        &self,
        main_topic: &str,
        configuration: &RetryTopicConfiguration,
    ) -> Arc<Vec<Arc<DestinationTopic>>> {
        let chain = Arc::new(configuration.chain_for(main_topic));
        let mut by_topic = self.by_topic.write();
        for (index, destination) in chain.iter().enumerate() {
            by_topic.insert(destination.name().to_string(), (chain.clone(), index));
        }
        self.mains
            .write()
            .insert(main_topic.to_string(), chain.clone());
        info!(
            main_topic = %main_topic,
            hops = chain.len(),
            "Registered retry chain"
        );
        chain
    }

    /// The destination a topic name belongs to, if registered
    pub fn destination_of(&self, topic: &str) -> Option<Arc<DestinationTopic>> {
        self.by_topic
            .read()
            .get(topic)
            .map(|(chain, index)| chain[*index].clone())
    }

    /// The full chain registered for a main topic
    pub fn chain_for_main(&self, main_topic: &str) -> Option<Vec<Arc<DestinationTopic>>> {
        self.mains.read().get(main_topic).map(|c| c.as_ref().clone())
    }

    /// Where a record that failed on `topic` goes next.
    ///
    /// `attempts` counts every failed delivery including the current one.
    /// A chain past its total timeout routes straight to the dead letter;
    /// a retry that exhausted its budget routes to the first DLT matching
    /// the error class, else the generic DLT.
    pub fn next_destination(
        &self,
        topic: &str,
        attempts: u32,
        error_class: &str,
        original_timestamp_ms: i64,
        now_ms: i64,
    ) -> Result<Arc<DestinationTopic>> {
        let (chain, index) = self
            .by_topic
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| ConveyorError::UnknownDestination(topic.to_string()))?;
        let current = &chain[index];

        if current.is_dlt() || current.is_no_ops() {
            // Terminal destinations re-route to themselves; the publisher
            // applies the DLT strategy.
            return Ok(current.clone());
        }

        let past_timeout = current
            .properties()
            .timeout_ms
            .map(|timeout| now_ms.saturating_sub(original_timestamp_ms) >= timeout as i64)
            .unwrap_or(false);

        if !past_timeout && current.should_retry(attempts, error_class) {
            if current.is_reusable() {
                return Ok(current.clone());
            }
            if let Some(next_retry) = chain.iter().skip(index + 1).find(|d| d.is_retry()) {
                debug!(
                    from = %topic,
                    to = %next_retry.name(),
                    attempts = %attempts,
                    "Routing to next retry hop"
                );
                return Ok(next_retry.clone());
            }
        }

        self.terminal_for(&chain, error_class)
    }

    /// The terminal destination for an error class: the first DLT whose
    /// match set contains it, else the generic DLT, else the no-op
    pub fn terminal_for(
        &self,
        chain: &[Arc<DestinationTopic>],
        error_class: &str,
    ) -> Result<Arc<DestinationTopic>> {
        if let Some(matched) = chain
            .iter()
            .find(|d| d.is_dlt() && d.matches_error(error_class))
        {
            return Ok(matched.clone());
        }
        if let Some(generic) = chain
            .iter()
            .find(|d| d.is_dlt() && d.properties().matching_error_classes.is_empty())
        {
            return Ok(generic.clone());
        }
        chain
            .iter()
            .find(|d| d.is_no_ops())
            .cloned()
            .ok_or_else(|| {
                ConveyorError::UnknownDestination("chain has no terminal destination".to_string())
            })
    }

    /// The retry destination closest to the end of the chain; the loop-back
    /// target when a dead-letter publish fails under
    /// [`DltStrategy::AlwaysRetryOnError`]
    pub fn last_retry_for(&self, topic: &str) -> Option<Arc<DestinationTopic>> {
        let (chain, _) = self.by_topic.read().get(topic).cloned()?;
        chain.iter().rev().find(|d| d.is_retry()).cloned()
    }
}

/// Endpoint descriptors for the consuming side of a chain: one container
/// per retry and dead-letter topic, named after the main endpoint
pub fn retry_endpoints(
    endpoint: &EndpointDescriptor,
    chain: &[Arc<DestinationTopic>],
) -> Vec<EndpointDescriptor> {
    chain
        .iter()
        .filter(|destination| !destination.is_main() && !destination.is_no_ops())
        .map(|destination| {
            let suffix = destination.suffix().trim_start_matches('-');
            EndpointDescriptor::new(
                format!("{}-{}", endpoint.id, suffix),
                endpoint.group_id.clone(),
                TopicSelection::Names(vec![destination.name().to_string()]),
            )
            .with_concurrency(1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential_config() -> RetryTopicConfiguration {
        RetryTopicConfiguration::builder()
            .max_attempts(3)
            .exponential_backoff(Duration::from_millis(1000), 2.0, Duration::from_secs(60))
            .retry_on(["IllegalStateException"])
            .build()
    }

    #[test]
    fn test_exponential_chain_topic_names() {
        let chain = exponential_config().chain_for("orders");
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
    }

    #[test]
    fn test_constant_backoff_collapses_to_reusable_retry() {
        let config = RetryTopicConfiguration::builder()
            .max_attempts(3)
            .fixed_backoff(Duration::from_millis(1000))
            .build();
        let chain = config.chain_for("orders");
        let names: Vec<&str> = chain.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["orders", "orders-retry", "orders-dlt"]);
        assert!(chain[1].is_reusable());
    }

    #[test]
    fn test_ordinal_suffixes_keep_one_topic_per_hop() {
        let config = RetryTopicConfiguration::builder()
            .max_attempts(2)
            .fixed_backoff(Duration::from_millis(1000))
            .suffix_strategy(SuffixStrategy::Ordinal)
            .build();
        let names: Vec<String> = config
            .chain_for("orders")
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["orders", "orders-retry-0", "orders-retry-1", "orders-dlt"]
        );
    }

    #[test]
    fn test_no_dlt_ends_with_no_ops_terminal() {
        let config = RetryTopicConfiguration::builder()
            .max_attempts(2)
            .exponential_backoff(Duration::from_millis(1000), 2.0, Duration::from_secs(60))
            .dlt_strategy(DltStrategy::NoDlt)
            .build();
        let chain = config.chain_for("orders");
        let last = chain.last().unwrap();
        assert!(last.is_no_ops());
        assert_eq!(last.name(), "orders-retry-2000-noOps");
    }

    #[test]
    fn test_resolver_walks_the_chain() {
        let resolver = DestinationTopicResolver::new();
        resolver.register("orders", &exponential_config());

        let next = resolver
            .next_destination("orders", 1, "IllegalStateException", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-retry-1000");

        let next = resolver
            .next_destination("orders-retry-1000", 2, "IllegalStateException", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-retry-2000");

        let next = resolver
            .next_destination("orders-retry-4000", 4, "IllegalStateException", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-dlt");
    }

    #[test]
    fn test_non_retryable_class_goes_straight_to_dlt() {
        let resolver = DestinationTopicResolver::new();
        resolver.register("orders", &exponential_config());

        let next = resolver
            .next_destination("orders", 1, "OtherError", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-dlt");
    }

    #[test]
    fn test_matched_dlt_takes_precedence() {
        let config = RetryTopicConfiguration::builder()
            .max_attempts(1)
            .fixed_backoff(Duration::from_millis(1000))
            .retry_on(["IllegalStateException"])
            .dlt_for(["DeserializationError"], "-deserialization-dlt")
            .build();
        let resolver = DestinationTopicResolver::new();
        resolver.register("orders", &config);

        let next = resolver
            .next_destination("orders", 1, "DeserializationError", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-deserialization-dlt");

        let next = resolver
            .next_destination("orders", 2, "IllegalStateException", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-dlt");
    }

    #[test]
    fn test_timeout_routes_to_dlt() {
        let config = RetryTopicConfiguration::builder()
            .max_attempts(3)
            .exponential_backoff(Duration::from_millis(1000), 2.0, Duration::from_secs(60))
            .timeout(Duration::from_millis(5000))
            .build();
        let resolver = DestinationTopicResolver::new();
        resolver.register("orders", &config);

        let next = resolver
            .next_destination("orders-retry-1000", 2, "AnyError", 1_000, 6_500)
            .unwrap();
        assert_eq!(next.name(), "orders-dlt");
    }

    #[test]
    fn test_reusable_retry_routes_to_itself() {
        let config = RetryTopicConfiguration::builder()
            .max_attempts(3)
            .fixed_backoff(Duration::from_millis(500))
            .build();
        let resolver = DestinationTopicResolver::new();
        resolver.register("orders", &config);

        let next = resolver
            .next_destination("orders-retry", 2, "AnyError", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-retry");

        let next = resolver
            .next_destination("orders-retry", 4, "AnyError", 0, 0)
            .unwrap();
        assert_eq!(next.name(), "orders-dlt");
    }

    #[test]
    fn test_retry_endpoints_follow_the_chain() {
        let endpoint = EndpointDescriptor::new(
            "orders-listener",
            "group-1",
            TopicSelection::Names(vec!["orders".into()]),
        );
        let chain = exponential_config().chain_for("orders");
        let endpoints = retry_endpoints(&endpoint, &chain);

        let ids: Vec<&str> = endpoints.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "orders-listener-retry-1000",
                "orders-listener-retry-2000",
                "orders-listener-retry-4000",
                "orders-listener-dlt"
            ]
        );
        assert!(endpoints.iter().all(|e| e.group_id == "group-1"));
    }
}
