//! Redpanda log client for lambda stages.
//!
//! This crate provides [`RedpandaLogClient`], the production implementation of
//! the [`LogClient`] trait from `lambdas-core`. It uses rdkafka, so it works
//! with Redpanda and any other Kafka-compatible broker.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │   StreamConsumer (group)     │
//!                 └──┬────────────┬───────────┬──┘
//!   rebalance cb     │            │ split     │ split
//!                    ▼            ▼           ▼
//!            ┌─────────────┐ ┌─────────┐ ┌─────────┐
//!            │ GroupContext│ │ queue p0│ │ queue p1│
//!            └──────┬──────┘ └────┬────┘ └────┬────┘
//!                   │ events      │ pump      │ pump
//!                   ▼             ▼           ▼
//!             RebalanceStream  MessageStream MessageStream
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Auto-commit is disabled; the runner commits after each checkpoint
//! - Reading resumes at an explicit offset (seek), not at the committed one
//! - Ordering is guaranteed within a partition, and the producer routes
//!   messages with the same key to the same partition
//! - A revocation blocks the group (bounded by `revoke_timeout`) until the
//!   runner has drained the revoked partitions
//!
//! # Example
//!
//! ```no_run
//! use lambdas_core::LogClient;
//! use lambdas_redpanda::RedpandaLogClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RedpandaLogClient::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .build()?;
//!
//! client.produce("rawdeltas", "doc-1", b"{}").await?;
//! let subscription = client.subscribe(&["rawdeltas".to_string()], "deli").await?;
//! # drop(subscription);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer;

use consumer::{GroupContext, RedpandaPartitionConsumer};
use lambdas_core::{LogClient, LogError, Offset, ProduceAck, Subscription};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::Consumer;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Redpanda log client.
///
/// Holds one producer shared by every stage of the process; each
/// [`LogClient::subscribe`] call creates its own group consumer.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout, retries
/// - **Consumer settings**: Offset reset, session timeout, revoke timeout
///
/// # Example
///
/// ```no_run
/// use lambdas_redpanda::RedpandaLogClient;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RedpandaLogClient::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .revoke_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaLogClient {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    auto_offset_reset: String,
    session_timeout: Duration,
    revoke_timeout: Duration,
    max_consecutive_errors: u32,
}

impl RedpandaLogClient {
    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, LogError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the client.
    #[must_use]
    pub fn builder() -> RedpandaLogClientBuilder {
        RedpandaLogClientBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    async fn join(&self, topics: &[String], consumer_group: &str) -> Result<Subscription, LogError> {
        let subscription_failed = |reason: String| LogError::SubscriptionFailed {
            topics: topics.to_vec(),
            reason,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let assigned = Arc::new(Mutex::new(HashSet::new()));
        let context = GroupContext {
            events: events_tx.clone(),
            assigned: Arc::clone(&assigned),
            revoke_timeout: self.revoke_timeout,
        };

        let consumer: consumer::GroupConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| subscription_failed(format!("Failed to subscribe to topics: {e}")))?;

        let consumer = Arc::new(consumer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Revocations block inside the rebalance callback, so the driver gets
        // a thread of its own instead of a runtime worker.
        let runtime = tokio::runtime::Handle::current();
        let driver = consumer::drive(
            Arc::clone(&consumer),
            events_tx,
            shutdown_rx,
            self.max_consecutive_errors,
        );
        tokio::task::spawn_blocking(move || runtime.block_on(driver));

        tracing::info!(
            topics = ?topics,
            consumer_group,
            auto_offset_reset = %self.auto_offset_reset,
            "Subscribed to topics"
        );

        let rebalances = async_stream::stream! {
            let mut rx = events_rx;
            while let Some(event) = rx.recv().await {
                yield event;
            }
        };

        Ok(Subscription {
            rebalances: Box::pin(rebalances),
            consumer: Arc::new(RedpandaPartitionConsumer {
                consumer,
                assigned,
                shutdown: shutdown_tx,
                timeout: self.timeout,
            }),
        })
    }

    async fn send(&self, topic: &str, partition_key: &str, payload: &[u8]) -> Result<ProduceAck, LogError> {
        let record = FutureRecord::to(topic).key(partition_key).payload(payload);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(topic, partition, offset, key = partition_key, "Message produced");
                let offset = Offset::try_from(offset).map_err(|_| LogError::ProduceFailed {
                    topic: topic.to_string(),
                    reason: format!("Broker returned invalid offset {offset}"),
                })?;
                Ok(ProduceAck { partition, offset })
            },
            Err((kafka_error, _)) => {
                tracing::error!(topic, key = partition_key, error = %kafka_error, "Failed to produce message");
                Err(LogError::ProduceFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                })
            },
        }
    }
}

/// Builder for configuring a [`RedpandaLogClient`].
#[derive(Default)]
#[must_use]
pub struct RedpandaLogClientBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    produce_retries: Option<u32>,
    revoke_timeout: Option<Duration>,
    max_consecutive_errors: Option<u32>,
}

impl RedpandaLogClientBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// - `acks`: "0" (no acks), "1" (leader ack), "all" (all replicas ack)
    ///
    /// Default: "all". With "all" the producer is also idempotent, so its
    /// internal retries never duplicate a message.
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the produce delivery timeout, also used for seeks and metadata queries.
    ///
    /// Default: 5 seconds
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where a partition without a usable offset starts reading:
    /// `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: "earliest"
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the consumer-group session timeout.
    ///
    /// Default: 10 seconds
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set how often the producer retries a failed send before reporting
    /// [`LogError::ProduceFailed`].
    ///
    /// Default: 5
    pub const fn produce_retries(mut self, retries: u32) -> Self {
        self.produce_retries = Some(retries);
        self
    }

    /// Set how long a revocation waits for the runner to drain.
    ///
    /// Default: 30 seconds
    pub const fn revoke_timeout(mut self, timeout: Duration) -> Self {
        self.revoke_timeout = Some(timeout);
        self
    }

    /// Set how many consecutive consumer errors end the subscription with
    /// [`RebalanceEvent::Lost`](lambdas_core::RebalanceEvent::Lost).
    ///
    /// Default: 20
    pub const fn max_consecutive_errors(mut self, errors: u32) -> Self {
        self.max_consecutive_errors = Some(errors);
        self
    }

    /// Build the [`RedpandaLogClient`].
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaLogClient, LogError> {
        let brokers = self
            .brokers
            .ok_or_else(|| LogError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let retries = self.produce_retries.unwrap_or(5);

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression)
            .set("retries", retries.to_string())
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" });

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            LogError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string());
        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            retries,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaLogClient created"
        );

        Ok(RedpandaLogClient {
            producer,
            brokers,
            timeout,
            auto_offset_reset,
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(10)),
            revoke_timeout: self.revoke_timeout.unwrap_or(Duration::from_secs(30)),
            max_consecutive_errors: self.max_consecutive_errors.unwrap_or(20).max(1),
        })
    }
}

impl LogClient for RedpandaLogClient {
    fn subscribe(
        &self,
        topics: &[String],
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, LogError>> + Send + '_>> {
        let topics = topics.to_vec();
        let consumer_group = consumer_group.to_string();
        Box::pin(async move { self.join(&topics, &consumer_group).await })
    }

    fn produce(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<ProduceAck, LogError>> + Send + '_>> {
        let topic = topic.to_string();
        let partition_key = partition_key.to_string();
        let payload = payload.to_vec();
        Box::pin(async move { self.send(&topic, &partition_key, &payload).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_log_client_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<RedpandaLogClient>();
        assert_sync::<RedpandaLogClient>();
    }

    #[test]
    fn build_requires_brokers() {
        let result = RedpandaLogClient::builder().build();
        assert!(matches!(result, Err(LogError::ConnectionFailed(_))));
    }

    #[test]
    fn build_applies_defaults() {
        // Creating a producer does not contact the broker
        let client = RedpandaLogClient::new("localhost:9092").unwrap();
        assert_eq!(client.brokers(), "localhost:9092");
        assert_eq!(client.auto_offset_reset, "earliest");
        assert_eq!(client.revoke_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_error_budget_is_raised_to_one() {
        let client = RedpandaLogClient::builder()
            .brokers("localhost:9092")
            .max_consecutive_errors(0)
            .build()
            .unwrap();
        assert_eq!(client.max_consecutive_errors, 1);
    }
}
