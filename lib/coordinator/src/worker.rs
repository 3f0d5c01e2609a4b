//! Worker records and the liveness state machine.
//!
//! ```text
//! Active <-> Unhealthy -> Offline
//! Active -> Draining -> (removed)
//! ```
//!
//! Offline is absorbing: a worker that went offline has had its work moved
//! elsewhere and must register again.

use chrono::{DateTime, Utc};
use flowgrid_core::WorkerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Liveness and scheduling status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Heartbeating and assignable.
    Active,
    /// Missed heartbeats or reported itself unhealthy; not assignable.
    Unhealthy,
    /// Being removed; its work is moving elsewhere.
    Draining,
    /// Silent past the offline threshold.
    Offline,
}

impl WorkerStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unhealthy => "unhealthy",
            Self::Draining => "draining",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling performance counters reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Units of work finished successfully.
    pub completed: u64,
    /// Units of work that failed.
    pub failed: u64,
    /// Mean duration over all finished units, in milliseconds.
    pub avg_duration_ms: f64,
}

impl WorkerStats {
    /// Folds one finished unit into the counters.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        let n = (self.completed + self.failed) as f64;
        self.avg_duration_ms += (duration_ms as f64 - self.avg_duration_ms) / n;
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }
}

/// A worker process as seen by the coordinator and the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: WorkerId,
    /// Network address the worker can be reached at.
    pub address: String,
    /// Maximum concurrent units of work.
    pub capacity: u32,
    /// Units currently in flight.
    #[serde(default)]
    pub current_load: u32,
    /// Capability labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: WorkerStats,
    /// Health flag from the latest heartbeat.
    #[serde(default = "default_reported_healthy")]
    pub reported_healthy: bool,
}

fn default_reported_healthy() -> bool {
    true
}

impl WorkerNode {
    /// Creates an Active worker with no load, seen now.
    #[must_use]
    pub fn new(id: impl Into<WorkerId>, address: impl Into<String>, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            address: address.into(),
            capacity,
            current_load: 0,
            tags: BTreeSet::new(),
            status: WorkerStatus::Active,
            last_heartbeat: now,
            registered_at: now,
            stats: WorkerStats::default(),
            reported_healthy: true,
        }
    }

    /// Adds capability tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Sets the current load.
    #[must_use]
    pub fn with_load(mut self, load: u32) -> Self {
        self.current_load = load;
        self
    }

    /// Sets the last heartbeat time.
    #[must_use]
    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = at;
        self
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.capacity
    }

    /// Returns true if the worker carries every required tag.
    #[must_use]
    pub fn has_tags(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.tags)
    }

    /// Returns true if new work may be placed on this worker.
    #[must_use]
    pub fn is_assignable(&self) -> bool {
        self.status == WorkerStatus::Active && self.has_capacity()
    }

    /// `current_load / capacity`; a zero-capacity worker counts as full.
    #[must_use]
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.capacity)
    }

    /// Compares load ratios exactly by cross-multiplying.
    #[must_use]
    pub fn cmp_load(&self, other: &Self) -> Ordering {
        let lhs = u64::from(self.current_load) * u64::from(other.capacity.max(1));
        let rhs = u64::from(other.current_load) * u64::from(self.capacity.max(1));
        lhs.cmp(&rhs)
    }

    /// Computes the status a health check should assign at `now`.
    ///
    /// Draining and Offline are left alone. A worker silent past
    /// `offline_after` goes Offline; past `unhealthy_after` it goes
    /// Unhealthy; otherwise it follows its last reported health flag.
    #[must_use]
    pub fn evaluate_status(
        &self,
        now: DateTime<Utc>,
        unhealthy_after: Duration,
        offline_after: Duration,
    ) -> WorkerStatus {
        if matches!(self.status, WorkerStatus::Draining | WorkerStatus::Offline) {
            return self.status;
        }

        let silence = (now - self.last_heartbeat).to_std().unwrap_or_default();
        if silence > offline_after {
            WorkerStatus::Offline
        } else if silence > unhealthy_after || !self.reported_healthy {
            WorkerStatus::Unhealthy
        } else {
            WorkerStatus::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const UNHEALTHY: Duration = Duration::from_secs(30);
    const OFFLINE: Duration = Duration::from_secs(60);

    #[test]
    fn fresh_worker_is_active() {
        let now = Utc::now();
        let worker = WorkerNode::new("w1", "10.0.0.1:7000", 4).seen_at(now);
        assert_eq!(worker.evaluate_status(now, UNHEALTHY, OFFLINE), WorkerStatus::Active);
    }

    #[test]
    fn silence_walks_through_states() {
        let now = Utc::now();
        let worker = WorkerNode::new("w1", "a", 4).seen_at(now);

        let at = |secs| now + TimeDelta::seconds(secs);
        assert_eq!(worker.evaluate_status(at(30), UNHEALTHY, OFFLINE), WorkerStatus::Active);
        assert_eq!(
            worker.evaluate_status(at(45), UNHEALTHY, OFFLINE),
            WorkerStatus::Unhealthy
        );
        assert_eq!(
            worker.evaluate_status(at(65), UNHEALTHY, OFFLINE),
            WorkerStatus::Offline
        );
    }

    #[test]
    fn unhealthy_recovers_when_heard_from() {
        let now = Utc::now();
        let mut worker = WorkerNode::new("w1", "a", 4).seen_at(now - TimeDelta::seconds(40));
        worker.status = worker.evaluate_status(now, UNHEALTHY, OFFLINE);
        assert_eq!(worker.status, WorkerStatus::Unhealthy);

        worker.last_heartbeat = now;
        assert_eq!(worker.evaluate_status(now, UNHEALTHY, OFFLINE), WorkerStatus::Active);
    }

    #[test]
    fn reported_unhealthy_stays_unhealthy() {
        let now = Utc::now();
        let mut worker = WorkerNode::new("w1", "a", 4).seen_at(now);
        worker.reported_healthy = false;
        assert_eq!(
            worker.evaluate_status(now, UNHEALTHY, OFFLINE),
            WorkerStatus::Unhealthy
        );
    }

    #[test]
    fn offline_and_draining_are_sticky() {
        let now = Utc::now();
        let mut worker = WorkerNode::new("w1", "a", 4).seen_at(now);
        worker.status = WorkerStatus::Offline;
        assert_eq!(worker.evaluate_status(now, UNHEALTHY, OFFLINE), WorkerStatus::Offline);
        worker.status = WorkerStatus::Draining;
        assert_eq!(worker.evaluate_status(now, UNHEALTHY, OFFLINE), WorkerStatus::Draining);
    }

    #[test]
    fn capacity_and_tags() {
        let worker = WorkerNode::new("w1", "a", 2)
            .with_tags(["gpu", "eu"])
            .with_load(2);
        assert!(!worker.has_capacity());
        assert!(!worker.is_assignable());

        let required: BTreeSet<String> = ["gpu".to_string()].into();
        assert!(worker.has_tags(&required));
        let missing: BTreeSet<String> = ["arm".to_string()].into();
        assert!(!worker.has_tags(&missing));
    }

    #[test]
    fn load_comparison_is_exact() {
        let a = WorkerNode::new("a", "a", 3).with_load(1);
        let b = WorkerNode::new("b", "b", 6).with_load(2);
        let c = WorkerNode::new("c", "c", 4).with_load(3);
        assert_eq!(a.cmp_load(&b), Ordering::Equal);
        assert_eq!(a.cmp_load(&c), Ordering::Less);
        assert!((c.load_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_track_rolling_average() {
        let mut stats = WorkerStats::default();
        stats.record(true, 100);
        stats.record(false, 300);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 2);
        assert!((stats.avg_duration_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn worker_json_roundtrip() {
        let worker = WorkerNode::new("w1", "10.0.0.1:7000", 8).with_tags(["gpu"]);
        let json = serde_json::to_string(&worker).expect("serialize");
        let parsed: WorkerNode = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, worker);
    }
}
