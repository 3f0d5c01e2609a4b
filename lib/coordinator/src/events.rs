//! Coordination events exchanged over the event bus.
//!
//! One typed record per topic. Events are validated before publishing so a
//! consumer never sees an empty ID or a nonsensical counter.

use crate::worker::WorkerStatus;
use chrono::{DateTime, Utc};
use flowgrid_core::{ExecutionId, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "worker.heartbeat")]
    WorkerHeartbeat,
    #[serde(rename = "work.completed")]
    WorkCompleted,
    #[serde(rename = "work.assigned")]
    WorkAssigned,
    #[serde(rename = "work.reassigned")]
    WorkReassigned,
    #[serde(rename = "worker.registered")]
    WorkerRegistered,
    #[serde(rename = "worker.unregistered")]
    WorkerUnregistered,
    #[serde(rename = "coordinator.metrics")]
    CoordinatorMetrics,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Self::WorkerHeartbeat,
        Self::WorkCompleted,
        Self::WorkAssigned,
        Self::WorkReassigned,
        Self::WorkerRegistered,
        Self::WorkerUnregistered,
        Self::CoordinatorMetrics,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerHeartbeat => "worker.heartbeat",
            Self::WorkCompleted => "work.completed",
            Self::WorkAssigned => "work.assigned",
            Self::WorkReassigned => "work.reassigned",
            Self::WorkerRegistered => "worker.registered",
            Self::WorkerUnregistered => "worker.unregistered",
            Self::CoordinatorMetrics => "coordinator.metrics",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness and load report from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    /// Units currently in flight on the worker.
    pub load: u32,
    /// Cumulative successful units.
    pub completed: u64,
    /// Cumulative failed units.
    pub failed: u64,
    /// Mean unit duration, in milliseconds.
    #[serde(default)]
    pub avg_duration_ms: f64,
    /// Whether the worker considers itself healthy.
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
}

/// A worker finished a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompleted {
    pub execution_id: ExecutionId,
    pub worker_id: WorkerId,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkAssigned {
    pub execution_id: ExecutionId,
    pub worker_id: WorkerId,
}

/// Why an execution moved between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignReason {
    /// The previous owner went offline.
    WorkerOffline,
    /// The previous owner unregistered or vanished from the registry.
    WorkerDeparted,
    /// The rebalance loop moved it off an overloaded worker.
    Rebalance,
}

impl fmt::Display for ReassignReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerOffline => write!(f, "worker_offline"),
            Self::WorkerDeparted => write!(f, "worker_departed"),
            Self::Rebalance => write!(f, "rebalance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkReassigned {
    pub execution_id: ExecutionId,
    pub from_worker: WorkerId,
    pub to_worker: WorkerId,
    pub reason: ReassignReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistered {
    pub worker_id: WorkerId,
    pub address: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerUnregistered {
    pub worker_id: WorkerId,
    /// Executions moved to other workers.
    pub reassigned: usize,
    /// Executions left without a worker.
    pub unassigned: usize,
}

/// Point-in-time view of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_workers: usize,
    pub active_workers: usize,
    pub unhealthy_workers: usize,
    pub draining_workers: usize,
    pub offline_workers: usize,
    /// In-flight units across Active workers.
    pub total_load: u64,
    /// Capacity across Active workers.
    pub total_capacity: u64,
    /// `total_load / total_capacity`, zero when there is no capacity.
    pub load_ratio: f64,
    pub active_assignments: usize,
    pub distributed_work: u64,
    pub reassignments: u64,
}

impl CoordinatorMetrics {
    /// Number of workers in `status`.
    #[must_use]
    pub fn count(&self, status: WorkerStatus) -> usize {
        match status {
            WorkerStatus::Active => self.active_workers,
            WorkerStatus::Unhealthy => self.unhealthy_workers,
            WorkerStatus::Draining => self.draining_workers,
            WorkerStatus::Offline => self.offline_workers,
        }
    }
}

/// Every event that travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    WorkerHeartbeat(WorkerHeartbeat),
    WorkCompleted(WorkCompleted),
    WorkAssigned(WorkAssigned),
    WorkReassigned(WorkReassigned),
    WorkerRegistered(WorkerRegistered),
    WorkerUnregistered(WorkerUnregistered),
    CoordinatorMetrics(CoordinatorMetrics),
}

impl CoordinationEvent {
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::WorkerHeartbeat(_) => Topic::WorkerHeartbeat,
            Self::WorkCompleted(_) => Topic::WorkCompleted,
            Self::WorkAssigned(_) => Topic::WorkAssigned,
            Self::WorkReassigned(_) => Topic::WorkReassigned,
            Self::WorkerRegistered(_) => Topic::WorkerRegistered,
            Self::WorkerUnregistered(_) => Topic::WorkerUnregistered,
            Self::CoordinatorMetrics(_) => Topic::CoordinatorMetrics,
        }
    }

    /// Checks the payload before it is published.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::WorkerHeartbeat(hb) => {
                require_id("worker_id", hb.worker_id.as_str())?;
                if !hb.avg_duration_ms.is_finite() || hb.avg_duration_ms < 0.0 {
                    return Err(format!("avg_duration_ms out of range: {}", hb.avg_duration_ms));
                }
                Ok(())
            }
            Self::WorkCompleted(done) => {
                require_id("execution_id", done.execution_id.as_str())?;
                require_id("worker_id", done.worker_id.as_str())
            }
            Self::WorkAssigned(assigned) => {
                require_id("execution_id", assigned.execution_id.as_str())?;
                require_id("worker_id", assigned.worker_id.as_str())
            }
            Self::WorkReassigned(moved) => {
                require_id("execution_id", moved.execution_id.as_str())?;
                require_id("from_worker", moved.from_worker.as_str())?;
                require_id("to_worker", moved.to_worker.as_str())?;
                if moved.from_worker == moved.to_worker {
                    return Err("from_worker and to_worker are the same".to_string());
                }
                Ok(())
            }
            Self::WorkerRegistered(registered) => {
                require_id("worker_id", registered.worker_id.as_str())?;
                if registered.capacity == 0 {
                    return Err("capacity must be positive".to_string());
                }
                Ok(())
            }
            Self::WorkerUnregistered(gone) => require_id("worker_id", gone.worker_id.as_str()),
            Self::CoordinatorMetrics(metrics) => {
                if !metrics.load_ratio.is_finite() || metrics.load_ratio < 0.0 {
                    return Err(format!("load_ratio out of range: {}", metrics.load_ratio));
                }
                let counted = metrics.active_workers
                    + metrics.unhealthy_workers
                    + metrics.draining_workers
                    + metrics.offline_workers;
                if counted != metrics.total_workers {
                    return Err(format!(
                        "status counts sum to {counted}, expected {}",
                        metrics.total_workers
                    ));
                }
                Ok(())
            }
        }
    }
}

fn require_id(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(())
}

impl From<WorkerHeartbeat> for CoordinationEvent {
    fn from(event: WorkerHeartbeat) -> Self {
        Self::WorkerHeartbeat(event)
    }
}

impl From<WorkCompleted> for CoordinationEvent {
    fn from(event: WorkCompleted) -> Self {
        Self::WorkCompleted(event)
    }
}

impl From<WorkAssigned> for CoordinationEvent {
    fn from(event: WorkAssigned) -> Self {
        Self::WorkAssigned(event)
    }
}

impl From<WorkReassigned> for CoordinationEvent {
    fn from(event: WorkReassigned) -> Self {
        Self::WorkReassigned(event)
    }
}

impl From<WorkerRegistered> for CoordinationEvent {
    fn from(event: WorkerRegistered) -> Self {
        Self::WorkerRegistered(event)
    }
}

impl From<WorkerUnregistered> for CoordinationEvent {
    fn from(event: WorkerUnregistered) -> Self {
        Self::WorkerUnregistered(event)
    }
}

impl From<CoordinatorMetrics> for CoordinationEvent {
    fn from(event: CoordinatorMetrics) -> Self {
        Self::CoordinatorMetrics(event)
    }
}
