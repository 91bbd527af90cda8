//! Integration tests for the lambda runner
//!
//! Rebalances, fault isolation between partitions, backpressure, health
//! reporting and service wiring.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{INPUT, STAGE, append, config, key, runner, tp};
use lambdas_core::{LambdaError, LogClient, LogError};
use lambdas_runtime::{
    LambdaResources, LambdaRunner, LambdaRunnerFactory, PartitionState, ResourcesFactory, RunnerConfig,
    RunnerError, ServiceError, run_service,
};
use lambdas_testing::helpers::{eventually, eventually_async, eventually_within};
use lambdas_testing::{InMemoryCheckpointStore, InMemoryLog, RecordingLambda};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn start_twice_is_rejected() {
    let log = InMemoryLog::new();
    let runner = runner(&RecordingLambda::new(), &log, &InMemoryCheckpointStore::new(), config().build());

    runner.start().await.unwrap();
    assert!(matches!(runner.start().await, Err(RunnerError::AlreadyStarted(_))));
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn stop_before_start_is_rejected() {
    let log = InMemoryLog::new();
    let runner = runner(&RecordingLambda::new(), &log, &InMemoryCheckpointStore::new(), config().build());
    assert!(matches!(runner.stop().await, Err(RunnerError::NotStarted(_))));
}

#[test]
fn invalid_config_is_rejected() {
    let result = LambdaRunner::new(
        STAGE,
        vec![INPUT.to_string()],
        RecordingLambda::new(),
        Arc::new(InMemoryLog::new()),
        Arc::new(InMemoryCheckpointStore::new()),
        RunnerConfig::builder().poll_window(0).build(),
    );
    assert!(matches!(result, Err(RunnerError::Config(_))));
}

#[tokio::test]
async fn stop_flushes_pending_progress() {
    let log = InMemoryLog::new();
    let store = InMemoryCheckpointStore::new();
    let lambda = RecordingLambda::new();
    let config = config()
        .checkpoint_batch_size(1000)
        .checkpoint_interval(Duration::from_secs(60))
        .build();
    let runner = runner(&lambda, &log, &store, config);
    runner.start().await.unwrap();

    append(&log, 0, 10);
    eventually(|| lambda.observed_offsets().len() == 10).await;
    assert_eq!(store.offset(&key(0)), None);

    runner.stop().await.unwrap();
    assert_eq!(store.offset(&key(0)), Some(9));
    assert!(!runner.health().await.running);
}

#[tokio::test]
async fn health_reports_partitions_and_lag() {
    let log = InMemoryLog::builder().default_partitions(2).build();
    let store = InMemoryCheckpointStore::new();
    let lambda = RecordingLambda::new();
    let runner = runner(&lambda, &log, &store, config().build());
    runner.start().await.unwrap();

    append(&log, 0, 5);
    append(&log, 1, 3);
    eventually(|| store.offset(&key(0)) == Some(4) && store.offset(&key(1)) == Some(2)).await;

    let handle = &runner;
    eventually_async(|| async move {
        let health = handle.health().await;
        health.partitions.len() == 2
            && health.total_lag == 0
            && health.partitions.iter().all(|status| status.high_watermark.is_some())
    })
    .await;

    let health = runner.health().await;
    assert!(health.is_healthy());
    assert_eq!(health.stage, STAGE);
    assert_eq!(health.partitions[0].checkpoint_offset, Some(4));
    assert_eq!(health.partitions[1].handled_offset, Some(2));
    assert!(
        health
            .partitions
            .iter()
            .all(|status| status.state == PartitionState::Running)
    );
    runner.stop().await.unwrap();
}

// ============================================================================
// Fault isolation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_partition_restarts_without_affecting_siblings() {
    let log = InMemoryLog::builder().default_partitions(2).build();
    let store = InMemoryCheckpointStore::new();
    let lambda = RecordingLambda::new().panic_once_at(2);
    let runner = runner(&lambda, &log, &store, config().build());
    runner.start().await.unwrap();

    append(&log, 0, 5);
    append(&log, 1, 5);
    eventually(|| store.offset(&key(0)) == Some(4) && store.offset(&key(1)) == Some(4)).await;

    let replays: Vec<_> = (0..2).map(|p| lambda.calls_at(&tp(p), 2)).collect();
    assert_eq!(replays.iter().sum::<usize>(), 3, "{replays:?}");
    for partition in 0..2 {
        // Nothing before the panic is handed over again
        assert_eq!(lambda.calls_at(&tp(partition), 1), 1);
    }
    assert_eq!(runner.health().await.total_faults, 1);
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn halted_partition_does_not_block_siblings() {
    let log = InMemoryLog::builder().default_partitions(2).build();
    let store = InMemoryCheckpointStore::new();
    let lambda = RecordingLambda::new()
        .fail_always_at(5, LambdaError::MalformedMessage {
            offset: 5,
            reason: "truncated".into(),
        });
    let runner = runner(&lambda, &log, &store, config().poison_threshold(2).build());
    runner.start().await.unwrap();

    // Partition 0 reaches the poison offset, partition 1 never does
    append(&log, 0, 10);
    append(&log, 1, 5);

    let handle = &runner;
    eventually_async(|| async move { handle.health().await.poisoned().count() == 1 }).await;
    eventually(|| store.offset(&key(1)) == Some(4)).await;

    let health = runner.health().await;
    assert_eq!(health.partitions[0].poisoned_offset, Some(5));
    assert_eq!(health.partitions[1].state, PartitionState::Running);
    assert_eq!(store.offset(&key(0)), Some(4));
    runner.stop().await.unwrap();
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn slow_partition_reads_at_most_its_window_ahead() {
    let window = 4;
    let log = InMemoryLog::builder().default_partitions(2).build();
    let store = InMemoryCheckpointStore::new();
    let lambda = RecordingLambda::new().with_partition_delay(0, Duration::from_millis(10));
    let runner = runner(&lambda, &log, &store, config().poll_window(window).build());
    runner.start().await.unwrap();

    append(&log, 0, 100);
    append(&log, 1, 100);

    eventually(|| lambda.observed_on(&tp(1)).len() == 100).await;
    assert!(lambda.observed_on(&tp(0)).len() < 100);

    assert_read_ahead_bounded(&lambda, &log, window).await;
    runner.stop().await.unwrap();
}

/// Assert that partition 0's reader never gets more than `window` ahead of its lambda.
async fn assert_read_ahead_bounded(lambda: &RecordingLambda, log: &InMemoryLog, window: usize) {
    for _ in 0..20 {
        let handled = lambda.observed_on(&tp(0)).last().copied().unwrap_or(0);
        let cursor = log.read_cursor(&tp(0)).unwrap_or(0);
        assert!(
            cursor <= handled + window as u64 + 2,
            "cursor {cursor} ran ahead of handled {handled}"
        );
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

#[tokio::test]
async fn slow_downstream_topic_stalls_only_its_partition() {
    let window = 4;
    let log = InMemoryLog::builder().default_partitions(2).build();
    let store = InMemoryCheckpointStore::new();
    log.set_produce_latency("slow-output", Some(Duration::from_millis(20)));
    let lambda = RecordingLambda::new()
        .emitting_on(0, "slow-output")
        .emitting_on(1, "fast-output");
    let runner = runner(&lambda, &log, &store, config().poll_window(window).build());
    runner.start().await.unwrap();

    append(&log, 0, 100);
    append(&log, 1, 100);

    eventually_within(Duration::from_secs(1), || store.offset(&key(1)) == Some(99)).await;
    assert_eq!(log.topic_messages("fast-output").len(), 100);
    assert!(log.topic_messages("slow-output").len() < 100);

    assert_read_ahead_bounded(&lambda, &log, window).await;
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn slow_checkpoint_store_stalls_only_its_partition() {
    let window = 4;
    let log = InMemoryLog::builder().default_partitions(2).build();
    let store = InMemoryCheckpointStore::new();
    store.set_save_latency(&key(0), Some(Duration::from_millis(20)));
    let lambda = RecordingLambda::new();
    let runner = runner(&lambda, &log, &store, config().poll_window(window).build());
    runner.start().await.unwrap();

    append(&log, 0, 100);
    append(&log, 1, 100);

    eventually_within(Duration::from_secs(1), || store.offset(&key(1)) == Some(99)).await;
    assert!(lambda.observed_on(&tp(0)).len() < 100);

    assert_read_ahead_bounded(&lambda, &log, window).await;
    runner.stop().await.unwrap();
}

// ============================================================================
// Rebalances
// ============================================================================

#[tokio::test]
async fn revoke_mid_message_hands_over_at_next_offset() {
    let log = InMemoryLog::builder().manual_assignment().build();
    let store = InMemoryCheckpointStore::new();
    append(&log, 0, 61);

    let first = RecordingLambda::new();
    let _gate = first.block_at(51);
    let config = config().drain_timeout(Duration::from_millis(100));
    let first_runner = runner(&first, &log, &store, config.clone().build());
    first_runner.start().await.unwrap();
    log.assign(0, vec![tp(0)]);

    eventually(|| first.observed_offsets().last() == Some(&51)).await;
    assert_eq!(store.offset(&key(0)), Some(50));

    // The drain gives up on 51 after the drain timeout and flushes 50
    assert!(log.revoke(0, vec![tp(0)]).await);
    assert_eq!(store.offset(&key(0)), Some(50));
    assert!(first_runner.health().await.partitions.is_empty());

    let second = RecordingLambda::new();
    let second_runner = runner(&second, &log, &store, config.build());
    second_runner.start().await.unwrap();
    log.assign(1, vec![tp(0)]);

    eventually(|| store.offset(&key(0)) == Some(60)).await;
    assert_eq!(second.observed_offsets(), (51..=60).collect::<Vec<_>>());
    assert_eq!(first.observed_offsets().last(), Some(&51));

    first_runner.stop().await.unwrap();
    second_runner.stop().await.unwrap();
}

#[tokio::test]
async fn late_flush_of_previous_owner_does_not_stall_new_owner() {
    let log = InMemoryLog::builder()
        .manual_assignment()
        .revoke_timeout(Duration::from_millis(50))
        .build();
    let store = InMemoryCheckpointStore::new();
    append(&log, 0, 30);

    // The first owner holds 0..=19 uncommitted and is stuck on 20
    let first = RecordingLambda::new();
    let _gate = first.block_at(20);
    let first_runner = runner(
        &first,
        &log,
        &store,
        config()
            .checkpoint_batch_size(1000)
            .checkpoint_interval(Duration::from_secs(60))
            .drain_timeout(Duration::from_millis(300))
            .build(),
    );
    first_runner.start().await.unwrap();
    log.assign(0, vec![tp(0)]);
    eventually(|| first.observed_offsets().last() == Some(&20)).await;
    assert_eq!(store.offset(&key(0)), None);

    // The log stops waiting before the drain flushes
    assert!(!log.revoke(0, vec![tp(0)]).await);

    let second = RecordingLambda::new().with_delay(Duration::from_millis(30));
    let second_runner = runner(&second, &log, &store, config().build());
    second_runner.start().await.unwrap();
    log.assign(1, vec![tp(0)]);

    // The first owner's flush of 19 lands while the second is still replaying
    eventually(|| store.history().iter().any(|checkpoint| checkpoint.offset == 19)).await;
    assert!(second.observed_offsets().last().is_some_and(|offset| *offset < 19));

    append(&log, 0, 20);
    eventually(|| store.offset(&key(0)) == Some(49)).await;

    let observed = second.observed_offsets();
    let resumed = observed.iter().position(|offset| *offset == 20).unwrap();
    assert!(observed[..resumed].iter().all(|offset| *offset < 20));
    assert_eq!(observed[resumed..], (20..=49).collect::<Vec<_>>());
    assert_eq!(log.assignment(1), vec![tp(0)]);

    let handle = &second_runner;
    eventually_async(|| async move {
        let health = handle.health().await;
        health.is_healthy() && health.total_lag == 0
    })
    .await;
    assert!(first_runner.health().await.partitions.is_empty());

    first_runner.stop().await.unwrap();
    second_runner.stop().await.unwrap();
}

#[tokio::test]
async fn reassigned_partition_resumes_from_checkpoint() {
    let log = InMemoryLog::builder().manual_assignment().build();
    let store = InMemoryCheckpointStore::new();
    let lambda = RecordingLambda::new();
    let runner = runner(&lambda, &log, &store, config().build());
    runner.start().await.unwrap();

    log.assign(0, vec![tp(0)]);
    append(&log, 0, 3);
    eventually(|| store.offset(&key(0)) == Some(2)).await;

    assert!(log.revoke(0, vec![tp(0)]).await);
    append(&log, 0, 2);
    log.assign(0, vec![tp(0)]);

    eventually(|| store.offset(&key(0)) == Some(4)).await;
    assert_eq!(lambda.observed_offsets(), vec![0, 1, 2, 3, 4]);
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn lost_connectivity_fails_the_runner() {
    let log = InMemoryLog::new();
    let store = InMemoryCheckpointStore::new();
    let lambda = RecordingLambda::new();
    let config = config()
        .checkpoint_batch_size(1000)
        .checkpoint_interval(Duration::from_secs(60))
        .build();
    let runner = runner(&lambda, &log, &store, config);
    runner.start().await.unwrap();

    append(&log, 0, 4);
    eventually(|| lambda.observed_offsets().len() == 4).await;

    log.lose(0, LogError::ConnectionFailed("broker gone".into()));
    let result = runner.wait().await;
    assert!(matches!(result, Err(RunnerError::LogUnavailable(_))));

    // Progress is flushed on the way out
    assert_eq!(store.offset(&key(0)), Some(3));
    assert!(!runner.health().await.running);
}

// ============================================================================
// Service wiring
// ============================================================================

struct InMemoryResources {
    log: InMemoryLog,
    store: InMemoryCheckpointStore,
    lambda: RecordingLambda,
    fail: bool,
}

impl ResourcesFactory for InMemoryResources {
    type Config = RunnerConfig;
    type Resources = LambdaResources<RecordingLambda>;

    async fn create(&self, config: &RunnerConfig) -> Result<Self::Resources, ServiceError> {
        if self.fail {
            return Err(ServiceError::Resources("database unreachable".into()));
        }
        let log: Arc<dyn LogClient> = Arc::new(self.log.clone());
        Ok(LambdaResources {
            stage: STAGE.to_string(),
            topics: vec![INPUT.to_string()],
            lambda: self.lambda.clone(),
            log,
            store: Arc::new(self.store.clone()),
            config: config.clone(),
        })
    }
}

#[tokio::test]
async fn run_service_runs_until_shutdown() {
    let resources = InMemoryResources {
        log: InMemoryLog::new(),
        store: InMemoryCheckpointStore::new(),
        lambda: RecordingLambda::new(),
        fail: false,
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let log = resources.log.clone();
    let store = resources.store.clone();
    let lambda = resources.lambda.clone();

    let service = tokio::spawn(async move {
        run_service(
            &resources,
            &LambdaRunnerFactory,
            &config().build(),
            STAGE,
            async move {
                let _ = shutdown_rx.await;
            },
        )
        .await
    });

    append(&log, 0, 3);
    eventually(|| lambda.observed_offsets().len() == 3).await;

    shutdown_tx.send(()).unwrap();
    service.await.unwrap().unwrap();
    assert_eq!(store.offset(&key(0)), Some(2));
}

#[tokio::test]
async fn run_service_fails_when_resources_fail() {
    let resources = InMemoryResources {
        log: InMemoryLog::new(),
        store: InMemoryCheckpointStore::new(),
        lambda: RecordingLambda::new(),
        fail: true,
    };
    let result = run_service(
        &resources,
        &LambdaRunnerFactory,
        &config().build(),
        STAGE,
        std::future::pending(),
    )
    .await;
    assert!(matches!(result, Err(ServiceError::Resources(_))));
}

#[tokio::test]
async fn run_service_surfaces_runner_failure() {
    let resources = InMemoryResources {
        log: InMemoryLog::new(),
        store: InMemoryCheckpointStore::new(),
        lambda: RecordingLambda::new(),
        fail: false,
    };
    let log = resources.log.clone();

    let service = tokio::spawn(async move {
        run_service(
            &resources,
            &LambdaRunnerFactory,
            &config().build(),
            STAGE,
            std::future::pending(),
        )
        .await
    });

    eventually(|| log.member_count() == 1).await;
    log.lose(0, LogError::TransportError("network partition".into()));

    let result = service.await.unwrap();
    assert!(matches!(
        result,
        Err(ServiceError::Runner(RunnerError::LogUnavailable(_)))
    ));
}
