//! Shared fixtures for runtime integration tests.

#![allow(dead_code)] // Not every test file uses every fixture
#![allow(clippy::unwrap_used)]

use lambdas_core::{Checkpoint, CheckpointKey, Offset, PartitionAssignment, TopicPartition};
use lambdas_runtime::{LambdaRunner, RetryPolicy, RunnerConfig, RunnerConfigBuilder};
use lambdas_testing::{InMemoryCheckpointStore, InMemoryLog, RecordingLambda, RecordingState};
use std::sync::Arc;
use std::time::Duration;

pub const STAGE: &str = "forward";
pub const INPUT: &str = "input";

pub fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(INPUT, partition)
}

pub fn key(partition: i32) -> CheckpointKey {
    CheckpointKey::for_assignment(&PartitionAssignment::new(STAGE, &tp(partition)))
}

/// Fast timings: commit after every message, short backoffs.
pub fn config() -> RunnerConfigBuilder {
    let quick = RetryPolicy::builder()
        .max_retries(2)
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build();

    RunnerConfig::builder()
        .checkpoint_batch_size(1)
        .checkpoint_interval(Duration::from_millis(50))
        .poll_window(8)
        .drain_timeout(Duration::from_millis(200))
        .shutdown_timeout(Duration::from_secs(2))
        .lag_refresh_interval(Duration::from_millis(20))
        .load_retry(quick.clone())
        .produce_retry(quick)
        .fault_backoff(
            RetryPolicy::builder()
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(50))
                .build(),
        )
}

pub fn runner(
    lambda: &RecordingLambda,
    log: &InMemoryLog,
    store: &InMemoryCheckpointStore,
    config: RunnerConfig,
) -> LambdaRunner<RecordingLambda> {
    LambdaRunner::new(
        STAGE,
        vec![INPUT.to_string()],
        lambda.clone(),
        Arc::new(log.clone()),
        Arc::new(store.clone()),
        config,
    )
    .unwrap()
}

/// Append `count` messages keyed `doc-<partition>` whose payload is their index.
pub fn append(log: &InMemoryLog, partition: i32, count: u64) {
    for index in 0..count {
        log.append(&tp(partition), &format!("doc-{partition}"), index.to_be_bytes().to_vec());
    }
}

/// Checkpoint as a previous owner would have left it after handling `0..=offset`.
pub fn previous_checkpoint(partition: i32, offset: Offset) -> Checkpoint {
    let state = RecordingState {
        handled: offset + 1,
        last_offset: Some(offset),
    };
    Checkpoint::new(
        &PartitionAssignment::new(STAGE, &tp(partition)),
        offset,
        serde_json::to_value(state).unwrap(),
    )
}

pub fn payload_index(payload: &[u8]) -> u64 {
    u64::from_be_bytes(payload.try_into().unwrap())
}
