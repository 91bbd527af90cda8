//! # Lambdas Service
//!
//! Wiring for the `lambdas` binary: configuration from the environment, the
//! production resources factory and the catalogue of stages a process can
//! host.
//!
//! ```bash
//! lambdas deli-0 deli
//! lambdas fanout-1 broadcaster
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod resources;

pub use config::{ConfigError, ServiceConfig};
pub use resources::StageResourcesFactory;

use clap::ValueEnum;
use lambdas_stages::{BroadcasterLambda, DeliLambda};

/// Stages the binary can host.
///
/// Scriptorium is not listed: it needs a snapshot storage backend, which an
/// embedding application supplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LambdaKind {
    /// Sequencing and deduplication of raw operations
    Deli,
    /// Fan-out of sequenced operations to clients
    Broadcaster,
}

impl LambdaKind {
    /// Stage name, also used as the consumer group.
    #[must_use]
    pub const fn stage(self) -> &'static str {
        match self {
            Self::Deli => "deli",
            Self::Broadcaster => "broadcaster",
        }
    }
}

/// Resources factory for deli.
#[must_use]
pub fn deli_factory(config: &ServiceConfig) -> StageResourcesFactory<DeliLambda> {
    StageResourcesFactory::new(
        LambdaKind::Deli.stage().to_string(),
        vec![config.topics.raw_deltas.clone()],
        DeliLambda::new(config.topics.deltas.clone()),
    )
}

/// Resources factory for the broadcaster.
#[must_use]
pub fn broadcaster_factory(config: &ServiceConfig) -> StageResourcesFactory<BroadcasterLambda> {
    StageResourcesFactory::new(
        LambdaKind::Broadcaster.stage().to_string(),
        vec![config.topics.deltas.clone()],
        BroadcasterLambda::new(config.topics.delivery.clone()),
    )
}
