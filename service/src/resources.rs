//! Production resources: Redpanda log client and Postgres checkpoint store.

use crate::config::ServiceConfig;
use lambdas_core::Lambda;
use lambdas_postgres::PostgresCheckpointStore;
use lambdas_redpanda::RedpandaLogClient;
use lambdas_runtime::{LambdaResources, ResourcesFactory, ServiceError};
use std::sync::Arc;
use std::time::Duration;

/// Builds [`LambdaResources`] for one stage against real infrastructure.
#[derive(Clone, Debug)]
pub struct StageResourcesFactory<L> {
    stage: String,
    topics: Vec<String>,
    lambda: L,
}

impl<L: Lambda + Clone> StageResourcesFactory<L> {
    /// Resources for `lambda` consuming `topics` under the name `stage`.
    #[must_use]
    pub const fn new(stage: String, topics: Vec<String>, lambda: L) -> Self {
        Self {
            stage,
            topics,
            lambda,
        }
    }
}

impl<L: Lambda + Clone> ResourcesFactory for StageResourcesFactory<L> {
    type Config = ServiceConfig;
    type Resources = LambdaResources<L>;

    async fn create(&self, config: &ServiceConfig) -> Result<LambdaResources<L>, ServiceError> {
        let kafka = &config.kafka;
        let log = RedpandaLogClient::builder()
            .brokers(&kafka.brokers)
            .producer_acks(&kafka.acks)
            .compression(&kafka.compression)
            .timeout(Duration::from_millis(kafka.timeout_ms))
            .session_timeout(Duration::from_millis(kafka.session_timeout_ms))
            .produce_retries(kafka.produce_retries)
            .revoke_timeout(Duration::from_millis(kafka.revoke_timeout_ms))
            .auto_offset_reset(&kafka.auto_offset_reset)
            .build()
            .map_err(|e| ServiceError::Resources(format!("Log client: {e}")))?;

        let store =
            PostgresCheckpointStore::connect(&config.postgres.url, config.postgres.max_connections)
                .await
                .map_err(|e| ServiceError::Resources(format!("Checkpoint store: {e}")))?;
        store
            .migrate()
            .await
            .map_err(|e| ServiceError::Resources(format!("Checkpoint store: {e}")))?;

        tracing::info!(
            stage = %self.stage,
            topics = ?self.topics,
            brokers = %kafka.brokers,
            "Resources created"
        );

        Ok(LambdaResources {
            stage: self.stage.clone(),
            topics: self.topics.clone(),
            lambda: self.lambda.clone(),
            log: Arc::new(log),
            store: Arc::new(store),
            config: config.runner_config(),
        })
    }
}
