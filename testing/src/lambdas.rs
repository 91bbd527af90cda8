//! Scripted lambdas that record what they observe.
//!
//! [`RecordingLambda`] advances on every message, optionally forwards each
//! payload to an output topic and can be told to fail, stall or panic at
//! specific offsets. Its state counts handled messages so tests can check
//! that state restored from a checkpoint matches the offsets it covers.

#![allow(clippy::unwrap_used)] // Test infrastructure, panics are acceptable
#![allow(clippy::missing_panics_doc)] // Test infrastructure

use lambdas_core::{
    Lambda, LambdaContext, LambdaError, LambdaOutput, LogMessage, Offset, OutboundMessage,
    PartitionId, TopicPartition,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// State of a [`RecordingLambda`], persisted in its checkpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingState {
    /// Messages handled since the partition started from scratch
    pub handled: u64,
    /// Last offset the state covers
    pub last_offset: Option<Offset>,
}

/// One observed invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    /// Partition of the message
    pub partition: TopicPartition,
    /// Offset of the message
    pub offset: Offset,
    /// State value the lambda was handed
    pub state: RecordingState,
}

/// Releases a message held by [`RecordingLambda::block_at`].
#[derive(Clone, Debug)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Let the held message through.
    pub fn release(&self) {
        self.open.send_replace(true);
    }
}

#[derive(Default)]
struct Script {
    failures: HashMap<Offset, VecDeque<LambdaError>>,
    always_fail: HashMap<Offset, LambdaError>,
    panics: HashSet<Offset>,
    holds: HashSet<Offset>,
    gates: HashMap<Offset, watch::Receiver<bool>>,
    delays: HashMap<PartitionId, Duration>,
    delay: Option<Duration>,
}

/// A lambda driven by a script, recording every call.
///
/// Cloning shares the script and the recordings, so a test keeps one clone
/// while the runner owns another.
///
/// # Example
///
/// ```
/// use lambdas_testing::RecordingLambda;
/// use lambdas_core::LambdaError;
///
/// let lambda = RecordingLambda::new()
///     .emitting_to("deltas")
///     .fail_once_at(3, LambdaError::SideEffect("flaky".into()));
/// assert!(lambda.observed_offsets().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct RecordingLambda {
    output_topic: Option<String>,
    partition_outputs: HashMap<PartitionId, String>,
    script: Arc<Mutex<Script>>,
    observed: Arc<Mutex<Vec<Observation>>>,
}

impl RecordingLambda {
    /// Advance on every message without emitting.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward each payload to `topic`, keyed like the input.
    #[must_use]
    pub fn emitting_to(mut self, topic: impl Into<String>) -> Self {
        self.output_topic = Some(topic.into());
        self
    }

    /// Forward payloads read from `partition` to `topic` instead.
    #[must_use]
    pub fn emitting_on(mut self, partition: PartitionId, topic: impl Into<String>) -> Self {
        self.partition_outputs.insert(partition, topic.into());
        self
    }

    /// Fail the next call at `offset` with `error`. Repeat to fail several times.
    #[must_use]
    pub fn fail_once_at(self, offset: Offset, error: LambdaError) -> Self {
        self.script
            .lock()
            .unwrap()
            .failures
            .entry(offset)
            .or_default()
            .push_back(error);
        self
    }

    /// Fail every call at `offset`.
    #[must_use]
    pub fn fail_always_at(self, offset: Offset, error: LambdaError) -> Self {
        self.script.lock().unwrap().always_fail.insert(offset, error);
        self
    }

    /// Panic the first time `offset` is handled.
    #[must_use]
    pub fn panic_once_at(self, offset: Offset) -> Self {
        self.script.lock().unwrap().panics.insert(offset);
        self
    }

    /// Return without advancing the checkpoint at `offset`.
    #[must_use]
    pub fn hold_at(self, offset: Offset) -> Self {
        self.script.lock().unwrap().holds.insert(offset);
        self
    }

    /// Sleep `delay` in every call.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().delay = Some(delay);
        self
    }

    /// Sleep `delay` in every call on partition `partition`.
    #[must_use]
    pub fn with_partition_delay(self, partition: PartitionId, delay: Duration) -> Self {
        self.script.lock().unwrap().delays.insert(partition, delay);
        self
    }

    /// Hold every call at `offset` until the returned gate is released.
    #[must_use]
    pub fn block_at(&self, offset: Offset) -> Gate {
        let (open, closed) = watch::channel(false);
        self.script.lock().unwrap().gates.insert(offset, closed);
        Gate { open: Arc::new(open) }
    }

    /// Every call, in call order.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        self.observed.lock().unwrap().clone()
    }

    /// Offsets of every call, in call order.
    #[must_use]
    pub fn observed_offsets(&self) -> Vec<Offset> {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .map(|observation| observation.offset)
            .collect()
    }

    /// Offsets of the calls on `partition`, in call order.
    #[must_use]
    pub fn observed_on(&self, partition: &TopicPartition) -> Vec<Offset> {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|observation| &observation.partition == partition)
            .map(|observation| observation.offset)
            .collect()
    }

    /// Forget every recorded call.
    pub fn clear_observations(&self) {
        self.observed.lock().unwrap().clear();
    }

    /// Number of calls at `offset` on `partition`.
    #[must_use]
    pub fn calls_at(&self, partition: &TopicPartition, offset: Offset) -> usize {
        self.observed_on(partition)
            .into_iter()
            .filter(|observed| *observed == offset)
            .count()
    }
}

enum Step {
    Fail(LambdaError),
    Panic,
    Proceed {
        hold: bool,
        delay: Option<Duration>,
        gate: Option<watch::Receiver<bool>>,
    },
}

impl RecordingLambda {
    fn next_step(&self, message: &LogMessage) -> Step {
        let mut script = self.script.lock().unwrap();
        let offset = message.offset;
        if script.panics.remove(&offset) {
            return Step::Panic;
        }
        if let Some(error) = script.failures.get_mut(&offset).and_then(VecDeque::pop_front) {
            return Step::Fail(error);
        }
        if let Some(error) = script.always_fail.get(&offset) {
            return Step::Fail(error.clone());
        }
        Step::Proceed {
            hold: script.holds.contains(&offset),
            delay: script.delays.get(&message.partition).copied().or(script.delay),
            gate: script.gates.get(&offset).cloned(),
        }
    }
}

impl Lambda for RecordingLambda {
    type State = RecordingState;

    async fn handle(
        &self,
        message: &LogMessage,
        context: &mut LambdaContext<Self::State>,
    ) -> Result<LambdaOutput, LambdaError> {
        self.observed.lock().unwrap().push(Observation {
            partition: message.topic_partition(),
            offset: message.offset,
            state: context.state.clone(),
        });

        let (hold, delay, gate) = match self.next_step(message) {
            Step::Fail(error) => return Err(error),
            #[allow(clippy::panic)] // Intentional panic for isolation tests
            Step::Panic => panic!("scripted panic at offset {}", message.offset),
            Step::Proceed { hold, delay, gate } => (hold, delay, gate),
        };

        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        context.state.handled += 1;
        context.state.last_offset = Some(message.offset);

        if hold {
            return Ok(LambdaOutput::hold());
        }
        let output_topic = self
            .partition_outputs
            .get(&message.partition)
            .or(self.output_topic.as_ref());
        Ok(match output_topic {
            Some(topic) => LambdaOutput::emit([OutboundMessage::new(
                topic.clone(),
                message.key.clone(),
                message.payload.clone(),
            )]),
            None => LambdaOutput::advance(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambdas_core::PartitionAssignment;

    fn context() -> LambdaContext<RecordingState> {
        LambdaContext::fresh(PartitionAssignment::new("test", &TopicPartition::new("in", 0)))
    }

    fn message(offset: Offset) -> LogMessage {
        LogMessage::new(&TopicPartition::new("in", 0), offset, "doc", vec![1, 2])
    }

    #[tokio::test]
    async fn records_calls_and_counts_state() {
        let lambda = RecordingLambda::new().emitting_to("out");
        let mut context = context();

        let output = lambda.handle(&message(0), &mut context).await.unwrap();
        assert_eq!(output.emit[0].topic, "out");
        lambda.handle(&message(1), &mut context).await.unwrap();

        assert_eq!(lambda.observed_offsets(), vec![0, 1]);
        assert_eq!(context.state.handled, 2);
        assert_eq!(context.state.last_offset, Some(1));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let lambda = RecordingLambda::new()
            .fail_once_at(4, LambdaError::SideEffect("first".into()))
            .fail_once_at(4, LambdaError::InvariantViolation("second".into()));
        let mut context = context();

        assert_eq!(
            lambda.handle(&message(4), &mut context).await,
            Err(LambdaError::SideEffect("first".into()))
        );
        assert!(lambda.handle(&message(4), &mut context).await.is_err());
        assert!(lambda.handle(&message(4), &mut context).await.is_ok());
        assert_eq!(lambda.calls_at(&TopicPartition::new("in", 0), 4), 3);
    }

    #[tokio::test]
    async fn partition_output_overrides_default_topic() {
        let lambda = RecordingLambda::new().emitting_to("out").emitting_on(1, "audit");
        let other = LogMessage::new(&TopicPartition::new("in", 1), 0, "doc", vec![3]);

        let default = lambda.handle(&message(0), &mut context()).await.unwrap();
        let routed = lambda.handle(&other, &mut context()).await.unwrap();

        assert_eq!(default.emit[0].topic, "out");
        assert_eq!(routed.emit[0].topic, "audit");
    }

    #[tokio::test]
    async fn hold_does_not_advance() {
        let lambda = RecordingLambda::new().hold_at(2);
        let output = lambda.handle(&message(2), &mut context()).await.unwrap();
        assert!(!output.checkpoint_advance);
    }

    #[tokio::test]
    async fn gate_holds_until_released() {
        let lambda = RecordingLambda::new();
        let gate = lambda.block_at(0);

        let handle = {
            let lambda = lambda.clone();
            tokio::spawn(async move { lambda.handle(&message(0), &mut context()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        gate.release();
        assert!(handle.await.unwrap().is_ok());
    }
}
