//! Daemon configuration.
//!
//! Loaded via the `config` crate from `FLOWGRID_*` environment variables.
//! Nested sections use `__`, e.g. `FLOWGRID_COORDINATOR__REBALANCE_INTERVAL_SECS=60`.

use flowgrid_coordinator::{CoordinatorConfig, RegistryConfig};
use serde::Deserialize;

/// Where worker records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackendKind {
    /// JetStream key-value bucket on the NATS server.
    #[default]
    Nats,
    /// In-process store; only useful for a single coordinator in development.
    Memory,
}

/// Daemon configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// JetStream bucket holding worker records.
    #[serde(default = "default_registry_bucket")]
    pub registry_bucket: String,

    #[serde(default)]
    pub registry_backend: RegistryBackendKind,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub registry: RegistryConfig,
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_registry_bucket() -> String {
    flowgrid_coordinator::nats::DEFAULT_REGISTRY_BUCKET.to_string()
}

impl DaemonConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("FLOWGRID")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn from_environment(environment: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_coordinator::PartitionStrategyKind;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<DaemonConfig, config::ConfigError> {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        DaemonConfig::from_environment(DaemonConfig::environment().source(Some(source)))
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = load(&[]).expect("defaults");
        assert_eq!(config.nats_url, "nats://127.0.0.1:4222");
        assert_eq!(config.registry_bucket, "flowgrid-workers");
        assert_eq!(config.registry_backend, RegistryBackendKind::Nats);
        assert_eq!(config.coordinator, CoordinatorConfig::default());
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn nested_sections_are_read() {
        let config = load(&[
            ("FLOWGRID_NATS_URL", "nats://nats.internal:4222"),
            ("FLOWGRID_REGISTRY_BACKEND", "memory"),
            ("FLOWGRID_COORDINATOR__REBALANCE_INTERVAL_SECS", "60"),
            ("FLOWGRID_COORDINATOR__PARTITION_STRATEGY", "range"),
            ("FLOWGRID_REGISTRY__ENTRY_TTL_SECS", "45"),
        ])
        .expect("parses");

        assert_eq!(config.nats_url, "nats://nats.internal:4222");
        assert_eq!(config.registry_backend, RegistryBackendKind::Memory);
        assert_eq!(config.coordinator.rebalance_interval_secs, 60);
        assert_eq!(
            config.coordinator.partition_strategy,
            PartitionStrategyKind::Range
        );
        assert_eq!(config.registry.entry_ttl_secs, 45);
    }
}
