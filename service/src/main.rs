//! Lambda stage process.
//!
//! Hosts one stage (`deli` or `broadcaster`) until SIGINT/SIGTERM or until
//! the runner fails, for example because the log became unreachable.
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run a sequencer
//! lambdas deli-0 deli
//! ```

use clap::Parser;
use lambdas_runtime::metrics::MetricsServer;
use lambdas_runtime::{LambdaRunnerFactory, run_service};
use lambdas_service::{LambdaKind, ServiceConfig, broadcaster_factory, deli_factory};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "lambdas", version, about = "Host a partition-bound lambda stage")]
struct Cli {
    /// Instance name, used in logs
    name: String,
    /// Stage to host
    #[arg(value_enum)]
    lambda: LambdaKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = ServiceConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        name = %cli.name,
        lambda = cli.lambda.stage(),
        brokers = %config.kafka.brokers,
        "Starting lambda service"
    );

    let mut metrics = MetricsServer::new(config.metrics.addr);
    if config.metrics.enabled {
        metrics.start()?;
        tracing::info!(addr = %config.metrics.addr, "Metrics server started");
    }

    match cli.lambda {
        LambdaKind::Deli => {
            run_service(
                &deli_factory(&config),
                &LambdaRunnerFactory,
                &config,
                &cli.name,
                shutdown_signal(),
            )
            .await?;
        },
        LambdaKind::Broadcaster => {
            run_service(
                &broadcaster_factory(&config),
                &LambdaRunnerFactory,
                &config,
                &cli.name,
                shutdown_signal(),
            )
            .await?;
        },
    }

    tracing::info!(name = %cli.name, "Lambda service exited");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(error) => {
                tracing::error!(error = %error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
