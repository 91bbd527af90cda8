//! Consumer-group side of the Redpanda log client.
//!
//! One [`StreamConsumer`] is shared by every partition of a subscription:
//!
//! - a driver task polls the main queue, which is what makes librdkafka serve
//!   rebalance callbacks
//! - [`GroupContext`] turns those callbacks into [`RebalanceEvent`]s
//! - every polled partition gets its own queue (`split_partition_queue`) and a
//!   pump task feeding a bounded channel, so a slow partition never stalls
//!   its siblings

use lambdas_core::{
    LogError, LogMessage, MessageStream, Offset, PartitionConsumer, RebalanceEvent, RevokeAck,
    TopicPartition,
};
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientContext, Offset as KafkaOffset, TopicPartitionList};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Attempts made to position a freshly split partition queue.
const SEEK_ATTEMPTS: u32 = 20;
const SEEK_BACKOFF: Duration = Duration::from_millis(100);

/// Partitions currently assigned to this member.
pub(crate) type AssignedSet = Arc<Mutex<HashSet<TopicPartition>>>;

/// Consumer context forwarding rebalances to the runner.
pub(crate) struct GroupContext {
    pub(crate) events: mpsc::UnboundedSender<RebalanceEvent>,
    pub(crate) assigned: AssignedSet,
    pub(crate) revoke_timeout: Duration,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(list) => {
                let partitions = to_partitions(list);
                if partitions.is_empty() {
                    return;
                }

                let (tx, rx) = std::sync::mpsc::sync_channel(1);
                tracing::info!(partitions = ?partitions, "Partitions revoked, waiting for drain");
                if self
                    .events
                    .send(RebalanceEvent::Revoked(partitions.clone(), RevokeAck::new(tx)))
                    .is_err()
                {
                    tracing::debug!("Rebalance receiver dropped, revoking without drain");
                } else {
                    // Blocks the driver thread; the group waits with us.
                    match rx.recv_timeout(self.revoke_timeout) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            tracing::info!(partitions = ?partitions, "Revoked partitions drained");
                        },
                        Err(RecvTimeoutError::Timeout) => {
                            tracing::warn!(
                                partitions = ?partitions,
                                timeout_ms = self.revoke_timeout.as_millis(),
                                "Revoke acknowledgement timed out"
                            );
                        },
                    }
                }

                let mut assigned = self.assigned.lock().unwrap_or_else(PoisonError::into_inner);
                for partition in &partitions {
                    assigned.remove(partition);
                }
            },
            Rebalance::Assign(_) => {},
            Rebalance::Error(error) => {
                tracing::warn!(error = %error, "Rebalance error");
            },
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(list) = rebalance {
            let partitions = to_partitions(list);
            if partitions.is_empty() {
                return;
            }

            self.assigned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(partitions.iter().cloned());
            tracing::info!(partitions = ?partitions, "Partitions assigned");
            if self.events.send(RebalanceEvent::Assigned(partitions)).is_err() {
                tracing::debug!("Rebalance receiver dropped, assignment not forwarded");
            }
        }
    }
}

pub(crate) type GroupConsumer = StreamConsumer<GroupContext>;

/// Poll the main queue until shutdown.
///
/// Nothing reads from the main queue except rebalance callbacks: every polled
/// partition has its own queue, and messages that arrive here before a split
/// are re-fetched by the seek that follows it.
pub(crate) async fn drive(
    consumer: Arc<GroupConsumer>,
    events: mpsc::UnboundedSender<RebalanceEvent>,
    mut shutdown: watch::Receiver<bool>,
    max_consecutive_errors: u32,
) {
    let mut consecutive_errors = 0_u32;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = consumer.recv() => match received {
                Ok(message) => {
                    consecutive_errors = 0;
                    tracing::trace!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        "Ignoring message delivered before its partition was polled"
                    );
                },
                Err(error) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        error = %error,
                        consecutive_errors,
                        "Consumer error"
                    );
                    if consecutive_errors >= max_consecutive_errors {
                        tracing::error!(error = %error, "Consumer connectivity lost");
                        let _ = events.send(RebalanceEvent::Lost(LogError::ConnectionFailed(
                            error.to_string(),
                        )));
                        break;
                    }
                    tokio::time::sleep(backoff(consecutive_errors)).await;
                },
            },
        }
    }

    tracing::debug!("Consumer driver exiting");
}

/// Partition operations of a [`RedpandaLogClient`](crate::RedpandaLogClient) subscription.
pub(crate) struct RedpandaPartitionConsumer {
    pub(crate) consumer: Arc<GroupConsumer>,
    pub(crate) assigned: AssignedSet,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) timeout: Duration,
}

impl RedpandaPartitionConsumer {
    async fn open(
        &self,
        partition: &TopicPartition,
        from_offset: Offset,
        window: usize,
    ) -> Result<MessageStream, LogError> {
        if !self.is_assigned(partition) {
            return Err(LogError::NotAssigned(partition.clone()));
        }

        let queue = self
            .consumer
            .split_partition_queue(&partition.topic, partition.partition)
            .ok_or_else(|| {
                LogError::TransportError(format!("No partition queue for {partition}"))
            })?;
        self.seek(partition, from_offset).await?;

        tracing::debug!(
            topic = %partition.topic,
            partition = partition.partition,
            from_offset,
            window,
            "Partition queue opened"
        );

        let (tx, mut rx) = mpsc::channel(window.max(1));
        tokio::spawn(pump(queue, partition.clone(), tx));

        let stream = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }

    /// Position the partition at `offset`.
    ///
    /// librdkafka refuses to seek a partition whose fetcher has not started
    /// yet, which is the normal state right after an assignment.
    async fn seek(&self, partition: &TopicPartition, offset: Offset) -> Result<(), LogError> {
        let target = kafka_offset(offset)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let consumer = Arc::clone(&self.consumer);
            let topic = partition.topic.clone();
            let id = partition.partition;
            let timeout = self.timeout;

            let result = tokio::task::spawn_blocking(move || {
                consumer.seek(&topic, id, KafkaOffset::Offset(target), timeout)
            })
            .await
            .map_err(|e| LogError::TransportError(format!("Seek task failed: {e}")))?;

            match result {
                Ok(()) => return Ok(()),
                Err(error) if attempt < SEEK_ATTEMPTS => {
                    tracing::trace!(partition = %partition, attempt, error = %error, "Seek not ready");
                    tokio::time::sleep(SEEK_BACKOFF).await;
                },
                Err(error) => {
                    return Err(LogError::TransportError(format!(
                        "Failed to seek {partition} to {offset}: {error}"
                    )));
                },
            }
        }
    }

    fn commit(&self, partition: &TopicPartition, offset: Offset) -> Result<(), LogError> {
        let commit_failed = |reason: String| LogError::CommitFailed {
            partition: partition.clone(),
            offset,
            reason,
        };

        // Kafka stores the next offset to read
        let next = offset
            .checked_add(1)
            .ok_or_else(|| commit_failed("offset overflow".to_string()))
            .and_then(|next| kafka_offset(next).map_err(|e| commit_failed(e.to_string())))?;

        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&partition.topic, partition.partition, KafkaOffset::Offset(next))
            .map_err(|e| commit_failed(e.to_string()))?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| commit_failed(e.to_string()))
    }

    async fn watermark(&self, partition: &TopicPartition) -> Result<Option<Offset>, LogError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = partition.topic.clone();
        let id = partition.partition;
        let timeout = self.timeout;

        let (_low, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(&topic, id, timeout)
        })
        .await
        .map_err(|e| LogError::TransportError(format!("Watermark task failed: {e}")))?
        .map_err(|e| LogError::TransportError(e.to_string()))?;

        Ok(highest_stored(high))
    }
}

impl PartitionConsumer for RedpandaPartitionConsumer {
    fn poll(
        &self,
        partition: &TopicPartition,
        from_offset: Offset,
        window: usize,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, LogError>> + Send + '_>> {
        let partition = partition.clone();
        Box::pin(async move { self.open(&partition, from_offset, window).await })
    }

    fn commit_offset(
        &self,
        partition: &TopicPartition,
        offset: Offset,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        let result = self.commit(partition, offset);
        Box::pin(async move { result })
    }

    fn high_watermark(
        &self,
        partition: &TopicPartition,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Offset>, LogError>> + Send + '_>> {
        let partition = partition.clone();
        Box::pin(async move { self.watermark(&partition).await })
    }

    fn is_assigned(&self, partition: &TopicPartition) -> bool {
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(partition)
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _ = self.shutdown.send(true);
            self.consumer.unsubscribe();
            self.assigned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            tracing::info!("Left consumer group");
        })
    }
}

/// Forward one partition queue into a bounded channel.
///
/// A full channel stops the pump, which stops reading the queue; librdkafka
/// then pauses fetching once its own prefetch limits are reached.
async fn pump(
    queue: StreamPartitionQueue<GroupContext>,
    partition: TopicPartition,
    tx: mpsc::Sender<Result<LogMessage, LogError>>,
) {
    loop {
        let item = tokio::select! {
            () = tx.closed() => break,
            received = queue.recv() => match received {
                Ok(message) => to_log_message(&partition, &message),
                Err(error) => Err(LogError::TransportError(error.to_string())),
            },
        };

        if tx.send(item).await.is_err() {
            break;
        }
    }

    tracing::trace!(partition = %partition, "Partition pump exiting");
}

fn to_log_message(
    partition: &TopicPartition,
    message: &BorrowedMessage<'_>,
) -> Result<LogMessage, LogError> {
    let offset = Offset::try_from(message.offset()).map_err(|_| {
        LogError::TransportError(format!("Invalid offset {} on {partition}", message.offset()))
    })?;
    let key = message
        .key()
        .map(|key| String::from_utf8_lossy(key).into_owned())
        .unwrap_or_default();
    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

    let mut log_message = LogMessage::new(partition, offset, key, payload);
    if let Some(produced_at) = message
        .timestamp()
        .to_millis()
        .and_then(chrono::DateTime::from_timestamp_millis)
    {
        log_message.produced_at = produced_at;
    }
    Ok(log_message)
}

pub(crate) fn to_partitions(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|element| TopicPartition::new(element.topic(), element.partition()))
        .collect()
}

pub(crate) fn kafka_offset(offset: Offset) -> Result<i64, LogError> {
    i64::try_from(offset)
        .map_err(|_| LogError::TransportError(format!("Offset {offset} exceeds the Kafka range")))
}

/// Kafka reports the next offset to be written; the highest stored one is just below it.
pub(crate) fn highest_stored(high_watermark: i64) -> Option<Offset> {
    if high_watermark <= 0 {
        return None;
    }
    Offset::try_from(high_watermark - 1).ok()
}

fn backoff(consecutive_errors: u32) -> Duration {
    Duration::from_millis(100 * u64::from(consecutive_errors.min(50)))
}
