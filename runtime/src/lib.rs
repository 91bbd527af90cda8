//! # Lambdas Runtime
//!
//! Hosts partition-bound lambda stages on a partitioned log.
//!
//! ## Core Components
//!
//! - **Partition Manager** ([`partition`]): loads the checkpoint, feeds the
//!   lambda in offset order, produces emissions, commits checkpoints, recovers
//!   from faults
//! - **Lambda Runner** ([`runner`]): one manager task per assigned partition,
//!   driven by consumer-group rebalance events
//! - **Service wiring** ([`service`]): resources and runner factories plus
//!   [`run_service`](service::run_service)
//!
//! ## Guarantees
//!
//! - Messages reach the lambda in strictly increasing offset order per partition
//! - A checkpoint never covers work the lambda has not declared durable
//! - Offsets at or below a checkpoint are never handed to the lambda again
//! - A faulted or panicked partition does not affect its siblings
//!
//! ## Example
//!
//! ```ignore
//! use lambdas_runtime::{LambdaRunner, RunnerConfig};
//!
//! let runner = LambdaRunner::new(
//!     "deli",
//!     vec!["rawdeltas".to_string()],
//!     deli,
//!     log_client,
//!     checkpoint_store,
//!     RunnerConfig::default(),
//! )?;
//!
//! runner.start().await?;
//! let health = runner.health().await;
//! runner.stop().await?;
//! ```

/// Runner configuration and poison policy
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// Partition manager state machine
pub mod partition;

/// Retry logic with exponential backoff
pub mod retry;

/// Lambda runner
pub mod runner;

/// Resources and runner factories
pub mod service;

/// Partition status and runner health
pub mod status;

pub use config::{ConfigError, PoisonPolicy, RunnerConfig, RunnerConfigBuilder};
pub use partition::{PartitionError, PartitionManager, PartitionOutcome, PartitionResources};
pub use retry::RetryPolicy;
pub use runner::{LambdaRunner, RunnerError};
pub use service::{
    LambdaResources, LambdaRunnerFactory, ResourcesFactory, Runner, RunnerFactory, ServiceError,
    run_service,
};
pub use status::{PartitionState, PartitionStatus, RunnerHealth, StatusBoard};
