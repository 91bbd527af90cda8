//! Construction-time wiring for a stage process.
//!
//! A service is assembled in two explicit steps, each behind a trait so every
//! piece can be swapped for an in-memory double in tests:
//!
//! 1. A [`ResourcesFactory`] turns configuration into live resources
//!    (log client, checkpoint store, lambda instance).
//! 2. A [`RunnerFactory`] assembles those resources into a [`Runner`].
//!
//! [`run_service`] then starts the runner and keeps it alive until a shutdown
//! signal arrives or the runner fails.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ServiceConfig::from_env()?;
//! run_service(&MyResourcesFactory, &LambdaRunnerFactory, &config, "deli", shutdown_signal()).await?;
//! ```

use crate::config::RunnerConfig;
use crate::runner::{LambdaRunner, RunnerError};
use crate::status::RunnerHealth;
use lambdas_core::{CheckpointStore, Lambda, LogClient};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors from service wiring.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Building resources failed
    #[error("Failed to create resources: {0}")]
    Resources(String),

    /// The runner could not be assembled, started or failed while running
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// A startable, stoppable host of stage work.
pub trait Runner: Send + Sync {
    /// Start consuming.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] if the runner cannot start.
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + '_>>;

    /// Drain and stop.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] if the stop does not complete cleanly.
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + '_>>;

    /// Resolve when the runner ends on its own.
    ///
    /// # Errors
    ///
    /// Returns the runner's terminal error.
    fn wait(&self) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + '_>>;

    /// Current health.
    fn health(&self) -> Pin<Box<dyn Future<Output = RunnerHealth> + Send + '_>>;
}

impl<L: Lambda> Runner for LambdaRunner<L> {
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + '_>> {
        Box::pin(Self::start(self))
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + '_>> {
        Box::pin(Self::stop(self))
    }

    fn wait(&self) -> Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + '_>> {
        Box::pin(Self::wait(self))
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = RunnerHealth> + Send + '_>> {
        Box::pin(Self::health(self))
    }
}

/// Builds the resources a runner needs from configuration.
pub trait ResourcesFactory: Send + Sync {
    /// Configuration consumed by this factory
    type Config: Send + Sync;
    /// Resources produced
    type Resources: Send;

    /// Build resources.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Resources`] if any resource cannot be built.
    /// This is process-fatal.
    fn create(
        &self,
        config: &Self::Config,
    ) -> impl Future<Output = Result<Self::Resources, ServiceError>> + Send;
}

/// Assembles a runner from resources.
pub trait RunnerFactory<R>: Send + Sync {
    /// Runner produced
    type Runner: Runner;

    /// Assemble a runner.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] if the resources cannot form a runner.
    fn create(&self, resources: R) -> Result<Self::Runner, ServiceError>;
}

/// Everything a [`LambdaRunner`] needs.
pub struct LambdaResources<L: Lambda> {
    /// Stage name, also the consumer group
    pub stage: String,
    /// Topics to consume
    pub topics: Vec<String>,
    /// Stage logic
    pub lambda: L,
    /// Shared log client
    pub log: Arc<dyn LogClient>,
    /// Shared checkpoint store
    pub store: Arc<dyn CheckpointStore>,
    /// Runner configuration
    pub config: RunnerConfig,
}

/// Assembles a [`LambdaRunner`] from [`LambdaResources`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LambdaRunnerFactory;

impl<L: Lambda> RunnerFactory<LambdaResources<L>> for LambdaRunnerFactory {
    type Runner = LambdaRunner<L>;

    fn create(&self, resources: LambdaResources<L>) -> Result<Self::Runner, ServiceError> {
        Ok(LambdaRunner::new(
            resources.stage,
            resources.topics,
            resources.lambda,
            resources.log,
            resources.store,
            resources.config,
        )?)
    }
}

/// Build, start and supervise one runner until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServiceError`] if construction fails, the runner cannot start,
/// the runner fails while running (for example lost log connectivity) or the
/// graceful stop fails.
pub async fn run_service<RF, F, S>(
    resources_factory: &RF,
    runner_factory: &F,
    config: &RF::Config,
    name: &str,
    shutdown: S,
) -> Result<(), ServiceError>
where
    RF: ResourcesFactory,
    F: RunnerFactory<RF::Resources>,
    S: Future<Output = ()>,
{
    tracing::info!(service = name, "Creating resources");
    let resources = resources_factory.create(config).await?;
    let runner = runner_factory.create(resources)?;

    runner.start().await?;
    tracing::info!(service = name, "Service started");

    tokio::pin!(shutdown);
    let result = tokio::select! {
        result = runner.wait() => {
            if let Err(error) = &result {
                tracing::error!(service = name, error = %error, "Runner terminated");
            }
            result
        }
        () = &mut shutdown => {
            tracing::info!(service = name, "Shutdown signal received");
            runner.stop().await
        }
    };

    tracing::info!(service = name, "Service stopped");
    Ok(result?)
}
