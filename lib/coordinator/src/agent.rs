//! Worker-side agent.
//!
//! Runs assigned nodes through a [`NodeExecutor`], reports each outcome as
//! `work.completed` and publishes `worker.heartbeat` on a fixed interval.

use crate::bus::EventBus;
use crate::error::EventBusError;
use crate::events::{WorkCompleted, WorkerHeartbeat};
use crate::work::UnitOfWork;
use crate::worker::WorkerStats;
use chrono::Utc;
use flowgrid_core::WorkerId;
use flowgrid_workflow::{NodeExecutionError, NodeExecutor, WorkflowNode};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct WorkerAgent {
    worker_id: WorkerId,
    bus: Arc<dyn EventBus>,
    executor: Arc<dyn NodeExecutor>,
    heartbeat_interval: Duration,
    in_flight: AtomicU32,
    healthy: AtomicBool,
    stats: Mutex<WorkerStats>,
    cancel: CancellationToken,
}

impl WorkerAgent {
    #[must_use]
    pub fn new(
        worker_id: impl Into<WorkerId>,
        bus: Arc<dyn EventBus>,
        executor: Arc<dyn NodeExecutor>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            bus,
            executor,
            heartbeat_interval,
            in_flight: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            stats: Mutex::new(WorkerStats::default()),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Units currently executing.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Sets the health flag carried by subsequent heartbeats.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Executes `node` for `unit` and reports the outcome.
    ///
    /// The executor's result is returned unchanged; a failure to publish the
    /// completion is logged, not surfaced.
    #[instrument(skip(self, unit, node, input), fields(worker_id = %self.worker_id, execution_id = %unit.execution_id))]
    pub async fn run(
        &self,
        unit: &UnitOfWork,
        node: &WorkflowNode,
        input: JsonValue,
    ) -> Result<JsonValue, NodeExecutionError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = self.executor.execute(node, input).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.stats.lock().await.record(result.is_ok(), duration_ms);
        match &result {
            Ok(_) => debug!(duration_ms, "node completed"),
            Err(e) => warn!(duration_ms, error = %e, "node failed"),
        }

        let completed = WorkCompleted {
            execution_id: unit.execution_id.clone(),
            worker_id: self.worker_id.clone(),
            success: result.is_ok(),
            duration_ms,
            error: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = self.bus.publish(completed.into()).await {
            warn!(error = %e, "failed to report completion");
        }
        result
    }

    /// Snapshot of the agent's current load and counters.
    pub async fn heartbeat(&self) -> WorkerHeartbeat {
        let stats = *self.stats.lock().await;
        WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            load: self.in_flight(),
            completed: stats.completed,
            failed: stats.failed,
            avg_duration_ms: stats.avg_duration_ms,
            healthy: self.healthy.load(Ordering::SeqCst),
            timestamp: Utc::now(),
        }
    }

    /// Publishes one heartbeat.
    ///
    /// # Errors
    ///
    /// Propagates the bus failure.
    pub async fn publish_heartbeat(&self) -> Result<(), Report<EventBusError>> {
        let heartbeat = self.heartbeat().await;
        self.bus.publish(heartbeat.into()).await
    }

    /// Starts the heartbeat loop. The first heartbeat goes out immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            info!(worker_id = %agent.worker_id, interval = ?agent.heartbeat_interval, "heartbeat loop started");
            loop {
                if let Err(e) = agent.publish_heartbeat().await {
                    warn!(worker_id = %agent.worker_id, error = %e, "failed to publish heartbeat");
                }
                tokio::select! {
                    () = agent.cancel.cancelled() => break,
                    () = tokio::time::sleep(agent.heartbeat_interval) => {}
                }
            }
            info!(worker_id = %agent.worker_id, "heartbeat loop exiting");
        })
    }

    /// Stops the heartbeat loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WorkerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("worker_id", &self.worker_id)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
