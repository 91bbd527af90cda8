//! Lambda runner: the per-process host of partition managers.
//!
//! A [`LambdaRunner`] joins the stage's consumer group and turns rebalance
//! events into partition manager lifecycles:
//!
//! ```text
//! Assigned([p..])     ──▶ spawn one PartitionManager task per partition
//! Revoked([p..], ack) ──▶ stop those managers, wait for their final
//!                         checkpoint flush, then acknowledge the revoke
//! Lost(error)         ──▶ drain everything, fail with LogUnavailable
//! ```
//!
//! Each manager runs in its own tokio task. A fault or panic in one
//! partition never blocks or crashes its siblings; a panicked manager is
//! restarted from its last checkpoint, as is one whose checkpoint was
//! superseded while the partition is still assigned here.

use crate::config::{ConfigError, RunnerConfig};
use crate::metrics::PartitionMetrics;
use crate::partition::{PartitionManager, PartitionOutcome, PartitionResources, stopped};
use crate::status::{PartitionState, PartitionStatus, RunnerHealth, StatusBoard};
use futures::StreamExt;
use lambdas_core::{
    CheckpointStore, Lambda, LogClient, LogError, PartitionAssignment, RebalanceEvent,
    RebalanceStream, TopicPartition,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::Instrument;

/// How often finished manager tasks are checked for panics.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from the lambda runner.
#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    /// The runner configuration is unusable
    #[error("Invalid runner configuration: {0}")]
    Config(#[from] ConfigError),

    /// `start` was called twice
    #[error("Runner for stage '{0}' already started")]
    AlreadyStarted(String),

    /// `stop` or `wait` was called before `start`
    #[error("Runner for stage '{0}' not started")]
    NotStarted(String),

    /// Joining the consumer group failed
    #[error("Failed to subscribe: {0}")]
    Subscribe(LogError),

    /// Connectivity to the log was lost beyond the client's retry budget
    #[error("Log unavailable: {0}")]
    LogUnavailable(LogError),

    /// Graceful stop did not finish in time
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

type Outcome = Option<Result<(), RunnerError>>;

/// Hosts the partition managers of one stage.
///
/// # Example
///
/// ```rust,ignore
/// let runner = LambdaRunner::new("deli", vec!["rawdeltas".into()], Deli::new(config), log, store, RunnerConfig::default())?;
/// runner.start().await?;
/// // ...
/// runner.stop().await?;
/// ```
pub struct LambdaRunner<L: Lambda> {
    stage: String,
    topics: Vec<String>,
    lambda: Arc<L>,
    log: Arc<dyn LogClient>,
    store: Arc<dyn CheckpointStore>,
    config: Arc<RunnerConfig>,
    status: StatusBoard,
    shutdown: watch::Sender<bool>,
    outcome: Arc<watch::Sender<Outcome>>,
    started: AtomicBool,
    running: Arc<AtomicBool>,
}

impl<L: Lambda> LambdaRunner<L> {
    /// Create a runner for `stage` consuming `topics`.
    ///
    /// The stage name doubles as the consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] if `config` fails validation.
    pub fn new(
        stage: impl Into<String>,
        topics: Vec<String>,
        lambda: L,
        log: Arc<dyn LogClient>,
        store: Arc<dyn CheckpointStore>,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let (outcome, _) = watch::channel(None);

        Ok(Self {
            stage: stage.into(),
            topics,
            lambda: Arc::new(lambda),
            log,
            store,
            config: Arc::new(config),
            status: StatusBoard::new(),
            shutdown,
            outcome: Arc::new(outcome),
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Join the consumer group and start the control loop.
    ///
    /// # Errors
    ///
    /// - [`RunnerError::AlreadyStarted`] if called twice
    /// - [`RunnerError::Subscribe`] if the group cannot be joined
    pub async fn start(&self) -> Result<(), RunnerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyStarted(self.stage.clone()));
        }

        let subscription = match self.log.subscribe(&self.topics, &self.stage).await {
            Ok(subscription) => subscription,
            Err(error) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(RunnerError::Subscribe(error));
            }
        };

        let control = ControlLoop {
            stage: self.stage.clone(),
            resources: PartitionResources {
                lambda: Arc::clone(&self.lambda),
                consumer: subscription.consumer,
                log: Arc::clone(&self.log),
                store: Arc::clone(&self.store),
                config: Arc::clone(&self.config),
                status: self.status.clone(),
            },
            managers: HashMap::new(),
            shutdown: self.shutdown.subscribe(),
        };

        let outcome = Arc::clone(&self.outcome);
        let running = Arc::clone(&self.running);
        let span = tracing::info_span!("lambda_runner", stage = %self.stage);
        running.store(true, Ordering::SeqCst);
        tokio::spawn(
            async move {
                let result = control.run(subscription.rebalances).await;
                running.store(false, Ordering::SeqCst);
                outcome.send_replace(Some(result));
            }
            .instrument(span),
        );

        tracing::info!(stage = %self.stage, topics = ?self.topics, "Lambda runner started");
        Ok(())
    }

    /// Drain every partition, leave the group and wait for the control loop.
    ///
    /// # Errors
    ///
    /// - [`RunnerError::ShutdownTimeout`] if draining exceeds the shutdown timeout
    /// - the runner's terminal error if it had already failed
    pub async fn stop(&self) -> Result<(), RunnerError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(RunnerError::NotStarted(self.stage.clone()));
        }

        tracing::info!(stage = %self.stage, "Stopping lambda runner");
        self.shutdown.send_replace(true);

        // The control loop bounds its own drain; the margin covers leaving the group.
        let limit = self.config.shutdown_timeout + Duration::from_secs(5);
        timeout(limit, self.wait())
            .await
            .unwrap_or(Err(RunnerError::ShutdownTimeout(limit)))
    }

    /// Resolve when the control loop ends.
    ///
    /// Cancel-safe; may be called any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::LogUnavailable`] if the log was lost.
    pub async fn wait(&self) -> Result<(), RunnerError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(RunnerError::NotStarted(self.stage.clone()));
        }

        let mut outcome = self.outcome.subscribe();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Ok(()))
    }

    /// Aggregated health of all hosted partitions.
    pub async fn health(&self) -> RunnerHealth {
        let partitions = self.status.snapshot().await;
        RunnerHealth {
            stage: self.stage.clone(),
            running: self.running.load(Ordering::SeqCst),
            total_lag: partitions.iter().map(PartitionStatus::lag).sum(),
            total_faults: partitions.iter().map(|status| status.fault_count).sum(),
            partitions,
        }
    }
}

struct ManagerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<PartitionOutcome>,
    exited: Option<PartitionOutcome>,
}

/// Owns the manager tasks; runs inside the runner's background task.
struct ControlLoop<L: Lambda> {
    stage: String,
    resources: PartitionResources<L>,
    managers: HashMap<TopicPartition, ManagerHandle>,
    shutdown: watch::Receiver<bool>,
}

impl<L: Lambda> ControlLoop<L> {
    async fn run(mut self, mut rebalances: RebalanceStream) -> Result<(), RunnerError> {
        let mut reap = interval(REAP_INTERVAL);

        let result = loop {
            tokio::select! {
                biased;
                () = stopped(&mut self.shutdown) => {
                    tracing::info!(stage = %self.stage, "Shutdown requested");
                    break Ok(());
                }
                event = rebalances.next() => match event {
                    Some(RebalanceEvent::Assigned(partitions)) => self.assign(partitions),
                    Some(RebalanceEvent::Revoked(partitions, ack)) => {
                        self.revoke(&partitions, self.resources.config.revoke_deadline()).await;
                        ack.acknowledge();
                    }
                    Some(RebalanceEvent::Lost(error)) => {
                        tracing::error!(stage = %self.stage, error = %error, "Log connectivity lost");
                        break Err(RunnerError::LogUnavailable(error));
                    }
                    None => {
                        tracing::error!(stage = %self.stage, "Rebalance stream ended");
                        break Err(RunnerError::LogUnavailable(LogError::Closed));
                    }
                },
                _ = reap.tick() => self.reap().await,
            }
        };

        let partitions: Vec<_> = self.managers.keys().cloned().collect();
        self.revoke(&partitions, self.resources.config.shutdown_timeout).await;
        self.resources.consumer.close().await;
        tracing::info!(stage = %self.stage, "Lambda runner stopped");
        result
    }

    fn assign(&mut self, partitions: Vec<TopicPartition>) {
        tracing::info!(stage = %self.stage, partitions = ?partitions, "Partitions assigned");
        for partition in partitions {
            if self
                .managers
                .get(&partition)
                .is_some_and(|handle| !handle.task.is_finished())
            {
                tracing::warn!(partition = %partition, "Partition already has a running manager");
                continue;
            }
            self.spawn(partition);
        }
        PartitionMetrics::record_assigned(&self.stage, self.managers.len());
    }

    fn spawn(&mut self, partition: TopicPartition) {
        let assignment = PartitionAssignment::new(self.stage.clone(), &partition);
        let (stop, stop_rx) = watch::channel(false);
        let span = tracing::info_span!(
            "partition",
            stage = %assignment.stage,
            topic = %assignment.topic,
            partition = assignment.partition
        );
        let manager = PartitionManager::new(assignment, self.resources.clone(), stop_rx);
        let task = tokio::spawn(manager.run().instrument(span));
        self.managers.insert(
            partition,
            ManagerHandle {
                stop,
                task,
                exited: None,
            },
        );
    }

    /// Stop the managers of `partitions` and wait up to `limit` for their final flush.
    async fn revoke(&mut self, partitions: &[TopicPartition], limit: Duration) {
        let handles: Vec<_> = partitions
            .iter()
            .filter_map(|partition| {
                self.managers
                    .remove(partition)
                    .map(|handle| (partition.clone(), handle))
            })
            .collect();
        if handles.is_empty() {
            return;
        }

        tracing::info!(stage = %self.stage, partitions = ?partitions, "Revoking partitions");
        for (_, handle) in &handles {
            handle.stop.send_replace(true);
        }

        let joined = futures::future::join_all(handles.into_iter().map(
            |(partition, mut handle)| async move {
                if let Some(outcome) = handle.exited {
                    return (partition, Ok(Ok(outcome)));
                }
                let result = timeout(limit, &mut handle.task).await;
                if result.is_err() {
                    handle.task.abort();
                }
                (partition, result)
            },
        ))
        .await;

        for (partition, result) in joined {
            match result {
                Ok(Ok(outcome)) => {
                    tracing::debug!(partition = %partition, outcome = ?outcome, "Partition manager finished");
                }
                Ok(Err(error)) => {
                    tracing::error!(partition = %partition, error = %error, "Partition manager panicked");
                }
                Err(_) => {
                    tracing::error!(
                        partition = %partition,
                        timeout_ms = limit.as_millis(),
                        "Partition manager did not stop in time, aborted"
                    );
                }
            }
            self.resources.status.remove(&partition).await;
        }
        PartitionMetrics::record_assigned(&self.stage, self.managers.len());
    }

    /// Restart managers that panicked or lost a checkpoint race while still assigned.
    async fn reap(&mut self) {
        let finished: Vec<_> = self
            .managers
            .iter()
            .filter(|(_, handle)| handle.exited.is_none() && handle.task.is_finished())
            .map(|(partition, _)| partition.clone())
            .collect();

        for partition in finished {
            let Some(handle) = self.managers.get_mut(&partition) else {
                continue;
            };
            let joined = (&mut handle.task).await;
            match joined {
                Ok(PartitionOutcome::Superseded) if self.resources.consumer.is_assigned(&partition) => {
                    // A previous owner flushed after this manager loaded its checkpoint
                    tracing::warn!(
                        partition = %partition,
                        "Checkpoint superseded while still assigned, reloading"
                    );
                    PartitionMetrics::record_reload(&self.stage);
                    self.spawn(partition);
                }
                Ok(outcome) => {
                    // Managers that lost ownership stay registered until the revoke that follows
                    tracing::debug!(partition = %partition, outcome = ?outcome, "Partition manager exited");
                    handle.exited = Some(outcome);
                }
                Err(error) => {
                    tracing::error!(
                        partition = %partition,
                        error = %error,
                        "Partition manager panicked, restarting from checkpoint"
                    );
                    let assignment = PartitionAssignment::new(self.stage.clone(), &partition);
                    let message = error.to_string();
                    self.resources
                        .status
                        .update(&assignment, |status| {
                            status.state = PartitionState::Faulted;
                            status.fault_count += 1;
                            status.last_error = Some(message);
                        })
                        .await;
                    PartitionMetrics::record_fault(&self.stage);
                    self.spawn(partition);
                }
            }
        }
    }
}
