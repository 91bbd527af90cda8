//! Partition manager: lifecycle of one partition's consumption.
//!
//! A [`PartitionManager`] owns one [`PartitionAssignment`] from assignment to
//! revocation. It rebuilds the lambda context from the checkpoint store,
//! feeds messages to the lambda in offset order, produces the lambda's
//! emissions and commits checkpoints in batches.
//!
//! # State Machine
//!
//! ```text
//!  Unassigned ──▶ LoadingCheckpoint ──▶ Running ──▶ Draining ──▶ Revoked
//!                       ▲                  │                        ▲
//!                       │    backoff       ▼                        │
//!                       └───────────── Faulted ─────────────────────┘
//! ```
//!
//! - Messages at or below the loaded checkpoint are never handed to the
//!   lambda: polling resumes at `checkpoint + 1` and redeliveries at or below
//!   the last handled offset are dropped.
//! - A message only counts as handled once every emission is produced.
//! - The checkpoint only covers offsets the lambda declared durable
//!   (`checkpoint_advance`), so it never runs ahead of completed work.
//! - Any lambda error, produce failure or checkpoint write failure faults the
//!   partition. After backoff the context is rebuilt from the last durable
//!   checkpoint and the uncommitted tail is reprocessed.
//! - A stale checkpoint rejection means someone else wrote a newer
//!   checkpoint; the manager stops without touching the checkpoint again.
//!   The runner reloads the partition if the consumer still owns it.

use crate::config::{PoisonPolicy, RunnerConfig};
use crate::metrics::{CheckpointMetrics, PartitionMetrics, ProducerMetrics};
use crate::retry::retry_with_predicate;
use crate::status::{PartitionState, StatusBoard};
use futures::StreamExt;
use lambdas_core::{
    Checkpoint, CheckpointError, CheckpointKey, CheckpointStore, DateTime, Lambda, LambdaContext,
    LambdaError, LogClient, LogError, LogMessage, Offset, OutboundMessage, PartitionAssignment,
    PartitionConsumer, TopicPartition, Utc,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, interval_at, sleep, timeout};

/// Errors that fault a partition.
#[derive(Error, Debug, Clone)]
pub enum PartitionError {
    /// The lambda rejected a message
    #[error("Lambda error: {0}")]
    Lambda(#[from] LambdaError),

    /// Polling or producing failed
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// Loading or saving the checkpoint failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The log closed the partition stream
    #[error("Message stream for {0} ended")]
    StreamEnded(TopicPartition),
}

impl PartitionError {
    /// Whether the failure is attributable to the message itself.
    ///
    /// Only these failures count towards poison detection.
    #[must_use]
    pub const fn is_logical(&self) -> bool {
        matches!(self, Self::Lambda(error) if !error.is_transient())
    }
}

/// How a partition manager finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Stopped on request after flushing its checkpoint
    Drained,
    /// Stopped because a newer checkpoint was written by another writer
    Superseded,
}

/// Handles shared by every partition manager of a runner.
pub struct PartitionResources<L: Lambda> {
    /// Stage logic
    pub lambda: Arc<L>,
    /// Consumer of the joined group
    pub consumer: Arc<dyn PartitionConsumer>,
    /// Producer for emissions and dead letters
    pub log: Arc<dyn LogClient>,
    /// Checkpoint persistence
    pub store: Arc<dyn CheckpointStore>,
    /// Runner configuration
    pub config: Arc<RunnerConfig>,
    /// Status table read by the runner
    pub status: StatusBoard,
}

impl<L: Lambda> Clone for PartitionResources<L> {
    fn clone(&self) -> Self {
        Self {
            lambda: Arc::clone(&self.lambda),
            consumer: Arc::clone(&self.consumer),
            log: Arc::clone(&self.log),
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            status: self.status.clone(),
        }
    }
}

/// Result of one pass through `LoadingCheckpoint → Running`.
enum Attempt {
    Drained,
    Superseded,
    Faulted(Fault),
}

struct Fault {
    message: Option<LogMessage>,
    error: PartitionError,
}

impl Fault {
    fn new(error: impl Into<PartitionError>) -> Self {
        Self {
            message: None,
            error: error.into(),
        }
    }

    fn at(message: LogMessage, error: PartitionError) -> Self {
        Self {
            message: Some(message),
            error,
        }
    }
}

/// Progress handled since the last commit.
struct PendingCheckpoint<S> {
    candidate: Option<(Offset, S)>,
    handled: usize,
}

impl<S> PendingCheckpoint<S> {
    const fn new() -> Self {
        Self {
            candidate: None,
            handled: 0,
        }
    }
}

/// Consecutive logical faults on one offset.
struct PoisonCandidate {
    offset: Offset,
    strikes: u32,
}

#[derive(Serialize)]
struct DeadLetter<'a> {
    stage: &'a str,
    topic: &'a str,
    partition: i32,
    offset: Offset,
    key: &'a str,
    error: String,
    payload: &'a [u8],
    failed_at: DateTime<Utc>,
}

/// Lifecycle of one partition's consumption.
pub struct PartitionManager<L: Lambda> {
    assignment: PartitionAssignment,
    topic_partition: TopicPartition,
    key: CheckpointKey,
    resources: PartitionResources<L>,
    stop: watch::Receiver<bool>,
    consecutive_faults: usize,
    poison: Option<PoisonCandidate>,
    dead_lettered: Option<Offset>,
}

impl<L: Lambda> PartitionManager<L> {
    /// Create a manager for `assignment` that runs until `stop` turns `true`.
    #[must_use]
    pub fn new(
        assignment: PartitionAssignment,
        resources: PartitionResources<L>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            topic_partition: assignment.topic_partition(),
            key: CheckpointKey::for_assignment(&assignment),
            assignment,
            resources,
            stop,
            consecutive_faults: 0,
            poison: None,
            dead_lettered: None,
        }
    }

    /// Process the partition until stopped or superseded.
    pub async fn run(mut self) -> PartitionOutcome {
        let mut stop = self.stop.clone();
        tracing::info!(assignment = %self.assignment, "Partition assigned");

        loop {
            self.set_state(PartitionState::LoadingCheckpoint).await;

            let loaded = tokio::select! {
                biased;
                () = stopped(&mut stop) => return self.finish(PartitionOutcome::Drained).await,
                loaded = self.load_context() => loaded,
            };

            let attempt = match loaded {
                Ok(context) => self.consume(context, &mut stop).await,
                Err(error) => Attempt::Faulted(Fault::new(error)),
            };

            match attempt {
                Attempt::Drained => return self.finish(PartitionOutcome::Drained).await,
                Attempt::Superseded => return self.finish(PartitionOutcome::Superseded).await,
                Attempt::Faulted(fault) => {
                    if !self.recover(fault, &mut stop).await {
                        return self.finish(PartitionOutcome::Drained).await;
                    }
                }
            }
        }
    }

    async fn load_context(&self) -> Result<LambdaContext<L::State>, PartitionError> {
        let store = &self.resources.store;
        let checkpoint = retry_with_predicate(
            &self.resources.config.load_retry,
            "checkpoint_load",
            || store.load(&self.key),
            CheckpointError::is_transient,
        )
        .await?;

        let Some(checkpoint) = checkpoint else {
            tracing::info!(assignment = %self.assignment, "No checkpoint, starting from offset 0");
            self.resources
                .status
                .update(&self.assignment, |status| status.checkpoint_offset = None)
                .await;
            return Ok(LambdaContext::fresh(self.assignment.clone()));
        };

        let state: L::State = serde_json::from_value(checkpoint.stage_state)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        tracing::info!(
            assignment = %self.assignment,
            offset = checkpoint.offset,
            updated_at = %checkpoint.updated_at,
            "Resuming from checkpoint"
        );
        self.resources
            .status
            .update(&self.assignment, |status| {
                status.checkpoint_offset = Some(checkpoint.offset);
                status.handled_offset = Some(checkpoint.offset);
            })
            .await;

        Ok(LambdaContext::new(
            self.assignment.clone(),
            state,
            Some(checkpoint.offset),
        ))
    }

    #[allow(clippy::too_many_lines)]
    async fn consume(
        &mut self,
        mut context: LambdaContext<L::State>,
        stop: &mut watch::Receiver<bool>,
    ) -> Attempt {
        let config = Arc::clone(&self.resources.config);
        let from_offset = context.last_offset.map_or(0, |offset| offset + 1);

        let mut stream = match self
            .resources
            .consumer
            .poll(&self.topic_partition, from_offset, config.poll_window)
            .await
        {
            Ok(stream) => stream,
            Err(error) => return Attempt::Faulted(Fault::new(error)),
        };

        self.set_state(PartitionState::Running).await;
        tracing::info!(assignment = %self.assignment, from_offset, "Partition running");

        let mut pending = PendingCheckpoint::new();
        let mut commit_tick = interval_at(
            tokio::time::Instant::now() + config.checkpoint_interval,
            config.checkpoint_interval,
        );
        commit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lag_tick = interval(config.lag_refresh_interval);
        lag_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next = tokio::select! {
                biased;
                () = stopped(stop) => return self.drain(&mut pending).await,
                _ = commit_tick.tick() => {
                    if let Err(attempt) = self.commit(&mut pending).await {
                        return attempt;
                    }
                    continue;
                }
                _ = lag_tick.tick() => {
                    self.refresh_lag().await;
                    continue;
                }
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(error)) => return self.fault_after_flush(&mut pending, Fault::new(error)).await,
                None => {
                    let error = PartitionError::StreamEnded(self.topic_partition.clone());
                    return self.fault_after_flush(&mut pending, Fault::new(error)).await;
                }
            };

            if context.last_offset.is_some_and(|last| message.offset <= last) {
                tracing::debug!(offset = message.offset, "Skipping redelivered message");
                PartitionMetrics::record_redelivery_skipped(&self.assignment.stage);
                continue;
            }

            let (result, draining) = if self.dead_lettered == Some(message.offset) {
                self.dead_lettered = None;
                tracing::warn!(offset = message.offset, "Skipping dead-lettered message");
                (Ok(true), false)
            } else {
                match self.dispatch(&message, &mut context, stop).await {
                    Some(dispatched) => dispatched,
                    None => {
                        tracing::warn!(
                            offset = message.offset,
                            timeout_ms = config.drain_timeout.as_millis(),
                            "In-flight message abandoned on drain"
                        );
                        return self.drain(&mut pending).await;
                    }
                }
            };

            match result {
                Ok(advance) => {
                    context.last_offset = Some(message.offset);
                    self.consecutive_faults = 0;
                    if self
                        .poison
                        .as_ref()
                        .is_some_and(|candidate| message.offset >= candidate.offset)
                    {
                        self.poison = None;
                    }
                    pending.handled += 1;
                    if advance {
                        pending.candidate = Some((message.offset, context.state.clone()));
                    }
                    self.resources
                        .status
                        .update(&self.assignment, |status| {
                            status.handled_offset = Some(message.offset);
                        })
                        .await;
                }
                Err(error) if draining => {
                    tracing::warn!(
                        offset = message.offset,
                        error = %error,
                        "In-flight message failed during drain"
                    );
                    return self.drain(&mut pending).await;
                }
                Err(error) => {
                    return self.fault_after_flush(&mut pending, Fault::at(message, error)).await;
                }
            }

            if draining {
                return self.drain(&mut pending).await;
            }

            if pending.handled >= config.checkpoint_batch_size {
                if let Err(attempt) = self.commit(&mut pending).await {
                    return attempt;
                }
            }
        }
    }

    /// Run [`Self::process`] for `message`, honouring a stop request.
    ///
    /// Returns the processing result and whether a drain began meanwhile, or
    /// `None` if the message did not finish within the drain timeout.
    async fn dispatch(
        &self,
        message: &LogMessage,
        context: &mut LambdaContext<L::State>,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<(Result<bool, PartitionError>, bool)> {
        let work = self.process(message, context);
        tokio::pin!(work);
        tokio::select! {
            biased;
            result = &mut work => Some((result, false)),
            () = stopped(stop) => {
                timeout(self.resources.config.drain_timeout, &mut work)
                    .await
                    .ok()
                    .map(|result| (result, true))
            }
        }
    }

    /// Hand one message to the lambda and produce its emissions.
    ///
    /// Returns whether the lambda allowed the checkpoint to advance.
    async fn process(
        &self,
        message: &LogMessage,
        context: &mut LambdaContext<L::State>,
    ) -> Result<bool, PartitionError> {
        let started = Instant::now();
        let output = match self.resources.lambda.handle(message, context).await {
            Ok(output) => output,
            Err(error) => {
                PartitionMetrics::record_lambda_error(&self.assignment.stage);
                return Err(error.into());
            }
        };
        PartitionMetrics::record_handled(&self.assignment.stage, started.elapsed());

        for outbound in &output.emit {
            self.produce(outbound).await?;
        }

        tracing::trace!(
            offset = message.offset,
            emitted = output.emit.len(),
            advance = output.checkpoint_advance,
            "Message handled"
        );
        Ok(output.checkpoint_advance)
    }

    async fn produce(&self, outbound: &OutboundMessage) -> Result<(), PartitionError> {
        let log = &self.resources.log;
        let started = Instant::now();
        let result = retry_with_predicate(
            &self.resources.config.produce_retry,
            "produce",
            || log.produce(&outbound.topic, &outbound.key, &outbound.payload),
            LogError::is_transient,
        )
        .await;

        match result {
            Ok(ack) => {
                ProducerMetrics::record_produce(&outbound.topic, started.elapsed());
                tracing::trace!(
                    target_topic = %outbound.topic,
                    target_partition = ack.partition,
                    target_offset = ack.offset,
                    "Emission produced"
                );
                Ok(())
            }
            Err(error) => {
                ProducerMetrics::record_error(&outbound.topic);
                Err(error.into())
            }
        }
    }

    /// Save the pending candidate, if any.
    ///
    /// Returns the attempt outcome when the partition must stop running.
    async fn commit(&self, pending: &mut PendingCheckpoint<L::State>) -> Result<(), Attempt> {
        pending.handled = 0;
        let Some((offset, state)) = pending.candidate.take() else {
            return Ok(());
        };

        match self.save(offset, &state).await {
            Ok(()) => Ok(()),
            Err(CheckpointError::Stale { .. }) => Err(Attempt::Superseded),
            Err(error) => Err(Attempt::Faulted(Fault::new(error))),
        }
    }

    async fn save(&self, offset: Offset, state: &L::State) -> Result<(), CheckpointError> {
        let stage_state =
            serde_json::to_value(state).map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let checkpoint = Checkpoint::new(&self.assignment, offset, stage_state);

        let started = Instant::now();
        match self.resources.store.save(&checkpoint).await {
            Ok(()) => {
                CheckpointMetrics::record_save(&self.assignment.stage, started.elapsed());
                self.resources
                    .status
                    .update(&self.assignment, |status| status.checkpoint_offset = Some(offset))
                    .await;
                tracing::debug!(offset, "Checkpoint saved");

                // The checkpoint store is the source of truth; the group offset
                // only helps external lag tooling.
                if let Err(error) = self
                    .resources
                    .consumer
                    .commit_offset(&self.topic_partition, offset)
                    .await
                {
                    tracing::debug!(offset, error = %error, "Offset commit failed");
                }
                Ok(())
            }
            Err(error @ CheckpointError::Stale { .. }) => {
                CheckpointMetrics::record_stale(&self.assignment.stage);
                tracing::warn!(
                    offset,
                    error = %error,
                    "Checkpoint rejected as stale, partition superseded"
                );
                Err(error)
            }
            Err(error) => {
                CheckpointMetrics::record_save_error(&self.assignment.stage);
                tracing::error!(offset, error = %error, "Checkpoint save failed");
                Err(error)
            }
        }
    }

    /// Keep durable progress before faulting on a lambda or log error.
    async fn fault_after_flush(
        &self,
        pending: &mut PendingCheckpoint<L::State>,
        fault: Fault,
    ) -> Attempt {
        match self.commit(pending).await {
            Err(Attempt::Superseded) => Attempt::Superseded,
            _ => Attempt::Faulted(fault),
        }
    }

    async fn drain(&self, pending: &mut PendingCheckpoint<L::State>) -> Attempt {
        self.set_state(PartitionState::Draining).await;
        tracing::info!(assignment = %self.assignment, "Draining partition");

        match self.commit(pending).await {
            Ok(()) => Attempt::Drained,
            Err(Attempt::Superseded) => Attempt::Superseded,
            Err(_) => {
                tracing::warn!(
                    assignment = %self.assignment,
                    "Final checkpoint flush failed, next owner will reprocess"
                );
                Attempt::Drained
            }
        }
    }

    /// Record a fault and wait out the backoff.
    ///
    /// Returns `false` when the manager must stop instead of reloading.
    async fn recover(&mut self, fault: Fault, stop: &mut watch::Receiver<bool>) -> bool {
        self.consecutive_faults += 1;
        let offset = fault.message.as_ref().map(|message| message.offset);
        let error_text = fault.error.to_string();

        PartitionMetrics::record_fault(&self.assignment.stage);
        self.resources
            .status
            .update(&self.assignment, |status| {
                status.state = PartitionState::Faulted;
                status.fault_count += 1;
                status.last_error = Some(error_text.clone());
            })
            .await;
        tracing::error!(
            assignment = %self.assignment,
            offset,
            consecutive_faults = self.consecutive_faults,
            error = %fault.error,
            "Partition faulted"
        );

        if let Some(message) = fault.message.as_ref().filter(|_| fault.error.is_logical()) {
            let strikes = self.strike(message.offset);
            if strikes >= self.resources.config.poison_threshold
                && !self.handle_poison(message, &fault.error, strikes).await
            {
                stopped(stop).await;
                return false;
            }
        }

        let delay = self
            .resources
            .config
            .fault_backoff
            .delay_for_attempt(self.consecutive_faults - 1);
        tracing::debug!(delay_ms = delay.as_millis(), "Backing off before reload");

        tokio::select! {
            biased;
            () = stopped(stop) => false,
            () = sleep(delay) => true,
        }
    }

    fn strike(&mut self, offset: Offset) -> u32 {
        match &mut self.poison {
            Some(candidate) if candidate.offset == offset => {
                candidate.strikes += 1;
                candidate.strikes
            }
            _ => {
                self.poison = Some(PoisonCandidate { offset, strikes: 1 });
                1
            }
        }
    }

    /// Apply the poison policy.
    ///
    /// Returns `false` when the partition is halted.
    async fn handle_poison(&mut self, message: &LogMessage, error: &PartitionError, strikes: u32) -> bool {
        PartitionMetrics::record_poison(&self.assignment.stage);
        let topic = match &self.resources.config.poison_policy {
            PoisonPolicy::Halt => {
                tracing::error!(
                    assignment = %self.assignment,
                    offset = message.offset,
                    strikes,
                    "Poison message, halting partition until revoked"
                );
                self.resources
                    .status
                    .update(&self.assignment, |status| {
                        status.poisoned_offset = Some(message.offset);
                    })
                    .await;
                return false;
            }
            PoisonPolicy::DeadLetter { topic } => topic.clone(),
        };

        match self.dead_letter(&topic, message, error).await {
            Ok(()) => {
                PartitionMetrics::record_dead_lettered(&self.assignment.stage);
                tracing::warn!(
                    offset = message.offset,
                    dead_letter_topic = %topic,
                    strikes,
                    "Poison message dead-lettered"
                );
                self.poison = None;
                self.dead_lettered = Some(message.offset);
            }
            Err(dead_letter_error) => {
                tracing::error!(
                    offset = message.offset,
                    dead_letter_topic = %topic,
                    error = %dead_letter_error,
                    "Failed to dead-letter poison message"
                );
            }
        }
        true
    }

    async fn dead_letter(
        &self,
        topic: &str,
        message: &LogMessage,
        error: &PartitionError,
    ) -> Result<(), LogError> {
        let letter = DeadLetter {
            stage: &self.assignment.stage,
            topic: &message.topic,
            partition: message.partition,
            offset: message.offset,
            key: &message.key,
            error: error.to_string(),
            payload: &message.payload,
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&letter).map_err(|e| LogError::ProduceFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let log = &self.resources.log;
        retry_with_predicate(
            &self.resources.config.produce_retry,
            "dead_letter",
            || log.produce(topic, &message.key, &payload),
            LogError::is_transient,
        )
        .await
        .map(|_| ())
    }

    async fn refresh_lag(&self) {
        match self
            .resources
            .consumer
            .high_watermark(&self.topic_partition)
            .await
        {
            Ok(high_watermark) => {
                let mut lag = 0;
                self.resources
                    .status
                    .update(&self.assignment, |status| {
                        status.high_watermark = high_watermark;
                        lag = status.lag();
                    })
                    .await;
                PartitionMetrics::record_lag(
                    &self.assignment.stage,
                    &self.assignment.topic,
                    self.assignment.partition,
                    lag,
                );
            }
            Err(error) => {
                tracing::debug!(error = %error, "High watermark refresh failed");
            }
        }
    }

    async fn set_state(&self, state: PartitionState) {
        self.resources
            .status
            .update(&self.assignment, |status| status.state = state)
            .await;
        tracing::debug!(assignment = %self.assignment, state = %state, "Partition state changed");
    }

    async fn finish(&self, outcome: PartitionOutcome) -> PartitionOutcome {
        self.set_state(PartitionState::Revoked).await;
        tracing::info!(assignment = %self.assignment, outcome = ?outcome, "Partition revoked");
        outcome
    }
}

/// Resolve once `stop` turns `true`. A dropped sender counts as a stop.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
