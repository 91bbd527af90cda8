//! Messages, partitions and assignments.
//!
//! Ordering inside a partition is defined solely by [`Offset`]. Wall-clock
//! timestamps on messages are informational and never used for ordering.

use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a message within a partition.
pub type Offset = u64;

/// Partition number within a topic.
pub type PartitionId = i32;

/// A single partition of a topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: PartitionId,
}

impl TopicPartition {
    /// Create a new topic partition.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A partition handed to a stage by the consumer group.
///
/// This is the unit of parallelism and of checkpoint granularity: exactly one
/// partition manager processes a given assignment at any instant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionAssignment {
    /// Stage (consumer group) name
    pub stage: String,
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: PartitionId,
}

impl PartitionAssignment {
    /// Create an assignment of `topic_partition` to `stage`.
    #[must_use]
    pub fn new(stage: impl Into<String>, topic_partition: &TopicPartition) -> Self {
        Self {
            stage: stage.into(),
            topic: topic_partition.topic.clone(),
            partition: topic_partition.partition,
        }
    }

    /// The topic partition this assignment covers.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for PartitionAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}[{}]", self.stage, self.topic, self.partition)
    }
}

/// A message read from the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Topic the message was read from
    pub topic: String,
    /// Partition the message was read from
    pub partition: PartitionId,
    /// Offset within the partition
    pub offset: Offset,
    /// Partition key (document identifier for upstream topics)
    pub key: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Time the broker accepted the message
    pub produced_at: DateTime<Utc>,
}

impl LogMessage {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(
        topic_partition: &TopicPartition,
        offset: Offset,
        key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic_partition.topic.clone(),
            partition: topic_partition.partition,
            offset,
            key: key.into(),
            payload,
            produced_at: Utc::now(),
        }
    }

    /// The topic partition this message belongs to.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A message a lambda wants appended to a downstream topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Target topic
    pub topic: String,
    /// Partition key; messages with the same key land in the same partition
    pub key: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Create an outbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
        }
    }

    /// Create an outbound message with a JSON-encoded payload.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `value` cannot be serialized.
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, key, serde_json::to_vec(value)?))
    }
}

/// Acknowledgement of a successful append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceAck {
    /// Partition the message landed in
    pub partition: PartitionId,
    /// Offset assigned to the message
    pub offset: Offset,
}
