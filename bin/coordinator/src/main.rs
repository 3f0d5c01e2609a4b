//! Coordinator daemon.
//!
//! Connects to NATS, opens the worker registry, runs one [`Coordinator`]
//! until interrupted, then shuts everything down in reverse order.

mod config;

use crate::config::{DaemonConfig, RegistryBackendKind};
use flowgrid_coordinator::{
    Coordinator, MemoryRegistryBackend, NatsEventBus, NatsKvRegistryBackend, RegistryBackend,
    WorkerRegistry,
};
use rootcause::prelude::{Report, ResultExt};
use std::fmt;
use std::process;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Errors that stop the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DaemonError {
    Config { details: String },
    Connect { url: String, details: String },
    Registry,
    Coordinator,
    Signal { details: String },
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {details}"),
            Self::Connect { url, details } => write!(f, "failed to connect to {url}: {details}"),
            Self::Registry => write!(f, "failed to open worker registry"),
            Self::Coordinator => write!(f, "failed to start coordinator"),
            Self::Signal { details } => write!(f, "failed to wait for shutdown signal: {details}"),
        }
    }
}

impl std::error::Error for DaemonError {}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Err(error) = run().await else {
        tracing::info!("coordinator daemon exited");
        process::exit(0);
    };
    tracing::error!(error = %error, "coordinator daemon failed");
    process::exit(1);
}

async fn run() -> Result<(), Report<DaemonError>> {
    let config = DaemonConfig::from_env().map_err(|e| DaemonError::Config {
        details: e.to_string(),
    })?;
    tracing::info!(
        nats_url = %config.nats_url,
        registry_backend = ?config.registry_backend,
        partition_strategy = ?config.coordinator.partition_strategy,
        "loaded configuration"
    );

    let client = async_nats::connect(&config.nats_url)
        .await
        .map_err(|e| DaemonError::Connect {
            url: config.nats_url.clone(),
            details: e.to_string(),
        })?;

    let backend: Arc<dyn RegistryBackend> = match config.registry_backend {
        RegistryBackendKind::Nats => Arc::new(
            NatsKvRegistryBackend::new(
                client.clone(),
                &config.registry_bucket,
                config.registry.entry_ttl(),
            )
            .await
            .context(DaemonError::Registry)?,
        ),
        RegistryBackendKind::Memory => {
            tracing::warn!("using in-memory registry, workers are not shared across coordinators");
            Arc::new(MemoryRegistryBackend::new())
        }
    };

    let registry = Arc::new(WorkerRegistry::new(backend, config.registry.clone()));
    let bus = Arc::new(NatsEventBus::new(client));
    let coordinator = Arc::new(Coordinator::new(
        config.coordinator.clone(),
        Arc::clone(&registry),
        bus,
    ));

    registry.start().await;
    coordinator.start().await.context(DaemonError::Coordinator)?;

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");

    coordinator.shutdown().await;
    registry.shutdown(config.coordinator.shutdown_timeout()).await;

    signal.map_err(|e| DaemonError::Signal {
        details: e.to_string(),
    })?;
    Ok(())
}
