//! Coordinator and registry configuration.
//!
//! Both structs deserialize from any `config` source; every field has a
//! default so an empty source yields a working setup.

use serde::Deserialize;
use std::time::Duration;

/// Which partition strategy the work distributor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategyKind {
    /// Consistent hashing over a ring of virtual nodes.
    #[default]
    ConsistentHash,
    /// Contiguous chunks in input order.
    Range,
    /// `hash(item) mod worker_count`.
    Hash,
}

/// Timing and balancing parameters for the coordinator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoordinatorConfig {
    /// Period of the health check loop, in seconds.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Period of the rebalance loop, in seconds.
    #[serde(default = "default_rebalance_interval_secs")]
    pub rebalance_interval_secs: u64,

    /// Period of the metrics snapshot, in seconds.
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Silence after which an Active worker becomes Unhealthy, in seconds.
    #[serde(default = "default_unhealthy_threshold_secs")]
    pub unhealthy_threshold_secs: u64,

    /// Silence after which a worker becomes Offline, in seconds.
    #[serde(default = "default_offline_threshold_secs")]
    pub offline_threshold_secs: u64,

    /// Fraction above/below the fleet average that marks a worker
    /// overloaded/underloaded.
    #[serde(default = "default_load_imbalance_threshold")]
    pub load_imbalance_threshold: f64,

    /// How long shutdown waits for background loops, in seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Upper bound on a single registry backend call, in milliseconds.
    #[serde(default = "default_registry_timeout_ms")]
    pub registry_timeout_ms: u64,

    /// Strategy used by [`Coordinator::distribute`](crate::Coordinator::distribute).
    #[serde(default)]
    pub partition_strategy: PartitionStrategyKind,

    /// Ring replicas per worker for consistent hashing.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

fn default_health_check_interval_secs() -> u64 {
    10
}

fn default_rebalance_interval_secs() -> u64 {
    30
}

fn default_metrics_interval_secs() -> u64 {
    15
}

fn default_unhealthy_threshold_secs() -> u64 {
    30
}

fn default_offline_threshold_secs() -> u64 {
    60
}

fn default_load_imbalance_threshold() -> f64 {
    0.2
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_registry_timeout_ms() -> u64 {
    5000
}

fn default_virtual_nodes() -> usize {
    100
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            rebalance_interval_secs: default_rebalance_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            unhealthy_threshold_secs: default_unhealthy_threshold_secs(),
            offline_threshold_secs: default_offline_threshold_secs(),
            load_imbalance_threshold: default_load_imbalance_threshold(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            registry_timeout_ms: default_registry_timeout_ms(),
            partition_strategy: PartitionStrategyKind::default(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    #[must_use]
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    #[must_use]
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    #[must_use]
    pub fn unhealthy_threshold(&self) -> Duration {
        Duration::from_secs(self.unhealthy_threshold_secs)
    }

    #[must_use]
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }
}

/// Worker registry parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryConfig {
    /// Key prefix under which worker records are stored.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry of a registry entry that is not refreshed, in seconds.
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,

    /// Period of the full `list` poll that backstops the watch stream, in seconds.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_key_prefix() -> String {
    "workers".to_string()
}

fn default_entry_ttl_secs() -> u64 {
    30
}

fn default_refresh_interval_secs() -> u64 {
    10
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            entry_ttl_secs: default_entry_ttl_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
