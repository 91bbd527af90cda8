//! Integration tests for [`RedpandaLogClient`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Keyed produce and partition polling from an explicit offset
//! - Rebalance events on join
//! - High watermarks
//! - Offset commits
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p lambdas-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use lambdas_core::{LogClient, RebalanceEvent, Subscription, TopicPartition};
use lambdas_redpanda::RedpandaLogClient;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Start Kafka and return a client once the broker accepts produces.
async fn setup_client() -> (ContainerAsync<Kafka>, RedpandaLogClient) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    let client = RedpandaLogClient::builder()
        .brokers(&brokers)
        .revoke_timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create client");

    for attempt in 1..=60 {
        if client.produce("warmup", "warmup", b"{}").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return (kafka, client);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Kafka failed to become ready");
    }
    unreachable!()
}

/// Wait for the first assignment of a subscription.
async fn first_assignment(subscription: &mut Subscription) -> Vec<TopicPartition> {
    let event = tokio::time::timeout(Duration::from_secs(30), subscription.rebalances.next())
        .await
        .expect("Timeout waiting for assignment")
        .expect("Rebalance stream ended");

    match event {
        RebalanceEvent::Assigned(partitions) => partitions,
        other => panic!("Expected assignment, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn poll_resumes_from_requested_offset() {
    let (_kafka, client) = setup_client().await;

    for index in 0..10_u32 {
        client
            .produce("deltas", "doc-1", &index.to_be_bytes())
            .await
            .expect("Failed to produce");
    }

    let mut subscription = client
        .subscribe(&["deltas".to_string()], "poll-group")
        .await
        .expect("Failed to subscribe");
    let partitions = first_assignment(&mut subscription).await;
    assert_eq!(partitions, vec![TopicPartition::new("deltas", 0)]);

    let mut stream = subscription
        .consumer
        .poll(&partitions[0], 4, 8)
        .await
        .expect("Failed to poll");

    let mut offsets = Vec::new();
    while offsets.len() < 6 {
        let message = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("Transport error");
        assert_eq!(message.key, "doc-1");
        offsets.push(message.offset);
    }
    assert_eq!(offsets, (4..10).collect::<Vec<_>>());

    let high = subscription
        .consumer
        .high_watermark(&partitions[0])
        .await
        .expect("Failed to fetch watermark");
    assert_eq!(high, Some(9));

    subscription
        .consumer
        .commit_offset(&partitions[0], 9)
        .await
        .expect("Failed to commit");
    subscription.consumer.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn polling_an_unassigned_partition_fails() {
    let (_kafka, client) = setup_client().await;
    client.produce("other", "doc", b"x").await.expect("Failed to produce");

    let mut subscription = client
        .subscribe(&["other".to_string()], "unassigned-group")
        .await
        .expect("Failed to subscribe");
    first_assignment(&mut subscription).await;

    let result = subscription
        .consumer
        .poll(&TopicPartition::new("other", 99), 0, 8)
        .await;
    assert!(result.is_err());
    subscription.consumer.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn same_key_lands_in_same_partition() {
    let (_kafka, client) = setup_client().await;

    let first = client.produce("keyed", "doc-7", b"a").await.expect("produce");
    let second = client.produce("keyed", "doc-7", b"b").await.expect("produce");

    assert_eq!(first.partition, second.partition);
    assert!(second.offset > first.offset);
}
