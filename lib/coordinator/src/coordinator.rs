//! The worker coordinator.
//!
//! Owns the in-memory worker map and the partition map (execution ID to
//! worker), answers assignment requests, and runs the background loops:
//!
//! - **health**: moves silent workers to Unhealthy/Offline and reassigns the
//!   work of workers that went Offline
//! - **rebalance**: migrates mapped executions from overloaded to
//!   underloaded workers
//! - **metrics**: publishes a `coordinator.metrics` snapshot
//! - **events**: ingests `worker.heartbeat` and `work.completed`
//! - **registry**: follows the worker registry's change stream
//!
//! All state sits behind one `RwLock`. Nothing awaits network I/O while
//! holding it; registry calls and event publishing happen after the guard
//! is dropped.

use crate::bus::{EventBus, EventStream};
use crate::config::CoordinatorConfig;
use crate::distributor::{Partition, WorkDistributor};
use crate::error::{CoordinatorError, RegistryError};
use crate::events::{
    CoordinationEvent, CoordinatorMetrics, ReassignReason, Topic, WorkAssigned, WorkCompleted,
    WorkReassigned, WorkerHeartbeat, WorkerRegistered, WorkerUnregistered,
};
use crate::partition::strategy_for;
use crate::registry::{RegistryEvent, WorkerRegistry};
use crate::selection::{SelectionStrategy, WorkRequirements, select};
use crate::work::UnitOfWork;
use crate::worker::{WorkerNode, WorkerStats, WorkerStatus};
use chrono::{DateTime, Utc};
use flowgrid_core::{ExecutionId, WorkerId};
use futures::StreamExt;
use rootcause::prelude::{Report, ResultExt};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone)]
struct Assignment {
    worker_id: WorkerId,
    requirements: WorkRequirements,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    workers: BTreeMap<WorkerId, WorkerNode>,
    assignments: HashMap<ExecutionId, Assignment>,
    distributed: u64,
    reassignments: u64,
}

impl CoordinatorState {
    /// Chooses a worker for `execution_id`, records the mapping and bumps the
    /// worker's load. Returns the chosen worker after the update.
    fn place(
        &mut self,
        execution_id: &ExecutionId,
        requirements: &WorkRequirements,
    ) -> Option<WorkerNode> {
        let affinity_key = requirements.routing_key(execution_id);
        let candidates: Vec<&WorkerNode> = self
            .workers
            .values()
            .filter(|w| w.is_assignable() && w.has_tags(&requirements.tags))
            .collect();
        let chosen = select(
            &candidates,
            requirements.strategy,
            self.distributed,
            affinity_key,
        )?
        .id
        .clone();

        let worker = self.workers.get_mut(&chosen)?;
        worker.current_load += 1;
        let placed = worker.clone();

        self.assignments.insert(
            execution_id.clone(),
            Assignment {
                worker_id: chosen,
                requirements: requirements.clone(),
            },
        );
        self.distributed += 1;
        Some(placed)
    }

    /// Drops the mapping for `execution_id` and gives the load back.
    fn release(&mut self, execution_id: &ExecutionId) -> Option<Assignment> {
        let assignment = self.assignments.remove(execution_id)?;
        if let Some(worker) = self.workers.get_mut(&assignment.worker_id) {
            worker.current_load = worker.current_load.saturating_sub(1);
        }
        Some(assignment)
    }

    fn executions_of(&self, worker_id: &WorkerId) -> Vec<ExecutionId> {
        let mut executions: Vec<ExecutionId> = self
            .assignments
            .iter()
            .filter(|(_, a)| &a.worker_id == worker_id)
            .map(|(execution_id, _)| execution_id.clone())
            .collect();
        executions.sort();
        executions
    }

    /// Moves every execution off `worker_id` using least-loaded selection.
    fn reassign_from(&mut self, worker_id: &WorkerId) -> ReassignmentSummary {
        let mut summary = ReassignmentSummary::default();
        for execution_id in self.executions_of(worker_id) {
            let Some(previous) = self.release(&execution_id) else {
                continue;
            };
            let requirements = WorkRequirements {
                tags: previous.requirements.tags,
                ..WorkRequirements::with_strategy(SelectionStrategy::LeastLoaded)
            };
            match self.place(&execution_id, &requirements) {
                Some(worker) => summary.reassigned.push((execution_id, worker.id)),
                None => summary.unassigned.push(execution_id),
            }
        }
        self.reassignments += summary.reassigned.len() as u64;
        summary
    }

    /// Finds the next safe rebalance move, if any.
    ///
    /// Overloaded workers that still own a mapped execution are tried as the
    /// source most loaded first; underloaded workers with spare capacity as
    /// the destination least loaded first. Ties go to the lowest worker ID.
    /// The destination must carry every tag the moved execution requires,
    /// and the lowest such execution moves. A move is safe when it does not
    /// leave the source below the destination.
    fn next_rebalance_move(&self, upper: f64, lower: f64) -> Option<(ExecutionId, WorkerId, WorkerId)> {
        let active = || {
            self.workers
                .values()
                .filter(|w| w.status == WorkerStatus::Active && w.capacity > 0)
        };

        let mut sources: Vec<&WorkerNode> = active()
            .filter(|w| w.load_ratio() > upper)
            .filter(|w| self.assignments.values().any(|a| a.worker_id == w.id))
            .collect();
        sources.sort_by(|a, b| b.cmp_load(a).then_with(|| a.id.cmp(&b.id)));
        let mut targets: Vec<&WorkerNode> = active()
            .filter(|w| w.load_ratio() < lower && w.has_capacity())
            .collect();
        targets.sort_by(|a, b| a.cmp_load(b).then_with(|| a.id.cmp(&b.id)));

        for source in sources {
            let movable = self.executions_of(&source.id);
            for target in &targets {
                let after_source =
                    u64::from(source.current_load.saturating_sub(1)) * u64::from(target.capacity);
                let after_target = u64::from(target.current_load + 1) * u64::from(source.capacity);
                if after_source < after_target {
                    continue;
                }

                let fits = movable.iter().find(|execution_id| {
                    self.assignments
                        .get(*execution_id)
                        .is_some_and(|a| target.has_tags(&a.requirements.tags))
                });
                if let Some(execution_id) = fits {
                    return Some((execution_id.clone(), source.id.clone(), target.id.clone()));
                }
            }
        }
        None
    }

    fn active_worker_ids(&self) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Active)
            .map(|w| w.id.clone())
            .collect()
    }

    fn metrics(&self, timestamp: DateTime<Utc>) -> CoordinatorMetrics {
        let count = |status: WorkerStatus| self.workers.values().filter(|w| w.status == status).count();
        let active = self
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Active);
        let (total_load, total_capacity) = active.fold((0u64, 0u64), |(load, cap), w| {
            (load + u64::from(w.current_load), cap + u64::from(w.capacity))
        });
        let load_ratio = if total_capacity == 0 {
            0.0
        } else {
            total_load as f64 / total_capacity as f64
        };

        CoordinatorMetrics {
            timestamp,
            total_workers: self.workers.len(),
            active_workers: count(WorkerStatus::Active),
            unhealthy_workers: count(WorkerStatus::Unhealthy),
            draining_workers: count(WorkerStatus::Draining),
            offline_workers: count(WorkerStatus::Offline),
            total_load,
            total_capacity,
            load_ratio,
            active_assignments: self.assignments.len(),
            distributed_work: self.distributed,
            reassignments: self.reassignments,
        }
    }
}

/// Outcome of moving a worker's executions elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassignmentSummary {
    /// Executions that found a new worker.
    pub reassigned: Vec<(ExecutionId, WorkerId)>,
    /// Executions left without a worker; the caller must resubmit them.
    pub unassigned: Vec<ExecutionId>,
}

/// Coordinates work placement across a fleet of workers.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    bus: Arc<dyn EventBus>,
    distributor: WorkDistributor,
    state: RwLock<CoordinatorState>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<WorkerRegistry>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let distributor =
            WorkDistributor::new(strategy_for(config.partition_strategy, config.virtual_nodes));
        Self {
            config,
            registry,
            bus,
            distributor,
            state: RwLock::new(CoordinatorState::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn distributor(&self) -> &WorkDistributor {
        &self.distributor
    }

    async fn publish(&self, event: impl Into<CoordinationEvent>) {
        let event = event.into();
        let topic = event.topic();
        if let Err(e) = self.bus.publish(event).await {
            warn!(topic = %topic, error = %e, "failed to publish event");
        }
    }

    async fn registry_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, Report<RegistryError>>>,
    ) -> Result<T, Report<RegistryError>> {
        match tokio::time::timeout(self.config.registry_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout { operation }.into()),
        }
    }

    // ---- workers -------------------------------------------------------

    /// Registers a worker and makes it assignable.
    ///
    /// The worker is written to the registry first; a registry failure is
    /// returned and leaves the coordinator unchanged. Re-registering a known
    /// worker (including one that went Offline) reactivates it and keeps the
    /// load of executions still mapped to it.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::InvalidWorker`] for an empty ID or zero capacity,
    /// [`CoordinatorError::Registration`] if the registry call fails or times out.
    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    pub async fn register_worker(
        &self,
        mut worker: WorkerNode,
    ) -> Result<WorkerNode, Report<CoordinatorError>> {
        if worker.id.as_str().trim().is_empty() {
            return Err(CoordinatorError::InvalidWorker {
                worker_id: worker.id,
                reason: "worker id must not be empty".to_string(),
            }
            .into());
        }
        if worker.capacity == 0 {
            return Err(CoordinatorError::InvalidWorker {
                worker_id: worker.id,
                reason: "capacity must be positive".to_string(),
            }
            .into());
        }

        let now = Utc::now();
        worker.status = WorkerStatus::Active;
        worker.last_heartbeat = now;
        worker.registered_at = now;
        worker.reported_healthy = true;

        let worker_id = worker.id.clone();
        self.registry_call("register", self.registry.register(&worker))
            .await
            .context(CoordinatorError::Registration { worker_id })?;

        {
            let mut state = self.state.write().await;
            let mapped = state.executions_of(&worker.id).len();
            worker.current_load = u32::try_from(mapped).unwrap_or(u32::MAX);
            state.workers.insert(worker.id.clone(), worker.clone());
        }

        info!(
            address = %worker.address,
            capacity = worker.capacity,
            tags = ?worker.tags,
            "worker registered"
        );
        self.publish(WorkerRegistered {
            worker_id: worker.id.clone(),
            address: worker.address.clone(),
            capacity: worker.capacity,
        })
        .await;
        self.rebalance_partitions().await;
        Ok(worker)
    }

    /// Drains a worker, moves its work elsewhere and removes it.
    ///
    /// The worker leaves the coordinator even if the registry call fails;
    /// the failure is still returned so the caller can retry the removal.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownWorker`] if the worker is not registered,
    /// [`CoordinatorError::Unregistration`] if the registry call fails.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn unregister_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<ReassignmentSummary, Report<CoordinatorError>> {
        {
            let mut state = self.state.write().await;
            let Some(worker) = state.workers.get_mut(worker_id) else {
                return Err(CoordinatorError::UnknownWorker {
                    worker_id: worker_id.clone(),
                }
                .into());
            };
            worker.status = WorkerStatus::Draining;
        }
        info!("draining worker");

        let summary = self
            .reassign_work_from_worker(worker_id, ReassignReason::WorkerDeparted)
            .await;
        self.state.write().await.workers.remove(worker_id);

        info!(
            reassigned = summary.reassigned.len(),
            unassigned = summary.unassigned.len(),
            "worker unregistered"
        );
        self.publish(WorkerUnregistered {
            worker_id: worker_id.clone(),
            reassigned: summary.reassigned.len(),
            unassigned: summary.unassigned.len(),
        })
        .await;
        self.rebalance_partitions().await;

        self.registry_call("unregister", self.registry.unregister(worker_id))
            .await
            .context(CoordinatorError::Unregistration {
                worker_id: worker_id.clone(),
            })?;
        Ok(summary)
    }

    /// Applies a heartbeat received now.
    ///
    /// See [`Coordinator::heartbeat_at`].
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownWorker`] if the worker is not registered.
    pub async fn heartbeat(
        &self,
        heartbeat: &WorkerHeartbeat,
    ) -> Result<WorkerStatus, Report<CoordinatorError>> {
        self.heartbeat_at(heartbeat, Utc::now()).await
    }

    /// Applies a heartbeat received at `received_at`.
    ///
    /// Updates load, counters and last-seen time. Last-seen is the receive
    /// time; the worker's own timestamp is only logged, so a skewed worker
    /// clock cannot age or rejuvenate it. A worker that reports healthy
    /// leaves Unhealthy; one that reports unhealthy leaves Active.
    /// Heartbeats from an Offline worker are ignored: it has to register
    /// again. The worker's registry entry is renewed, or written again if it
    /// already expired; a registry failure is only logged.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownWorker`] if the worker is not registered.
    pub async fn heartbeat_at(
        &self,
        heartbeat: &WorkerHeartbeat,
        received_at: DateTime<Utc>,
    ) -> Result<WorkerStatus, Report<CoordinatorError>> {
        let worker_id = &heartbeat.worker_id;
        let (status, changed, record) = {
            let mut state = self.state.write().await;
            let Some(worker) = state.workers.get_mut(worker_id) else {
                return Err(CoordinatorError::UnknownWorker {
                    worker_id: worker_id.clone(),
                }
                .into());
            };

            if worker.status == WorkerStatus::Offline {
                warn!(worker_id = %worker_id, "heartbeat from offline worker ignored, re-registration required");
                return Ok(WorkerStatus::Offline);
            }

            worker.current_load = heartbeat.load;
            worker.stats = WorkerStats {
                completed: heartbeat.completed,
                failed: heartbeat.failed,
                avg_duration_ms: heartbeat.avg_duration_ms,
            };
            worker.last_heartbeat = worker.last_heartbeat.max(received_at);
            worker.reported_healthy = heartbeat.healthy;

            let previous = worker.status;
            match (worker.status, heartbeat.healthy) {
                (WorkerStatus::Unhealthy, true) => {
                    worker.status = WorkerStatus::Active;
                    info!(worker_id = %worker_id, "worker recovered");
                }
                (WorkerStatus::Active, false) => {
                    worker.status = WorkerStatus::Unhealthy;
                    warn!(worker_id = %worker_id, "worker reports unhealthy");
                }
                _ => {}
            }
            trace!(
                worker_id = %worker_id,
                load = heartbeat.load,
                sent_at = %heartbeat.timestamp,
                skew_ms = (received_at - heartbeat.timestamp).num_milliseconds(),
                "heartbeat applied"
            );
            (worker.status, worker.status != previous, worker.clone())
        };

        if changed {
            self.rebalance_partitions().await;
        }
        self.renew_registration(&record).await;
        Ok(status)
    }

    /// Refreshes the worker's registry entry, writing it again if it expired.
    async fn renew_registration(&self, worker: &WorkerNode) {
        let Err(e) = self
            .registry_call("refresh", self.registry.refresh(&worker.id))
            .await
        else {
            return;
        };
        if !matches!(e.current_context(), RegistryError::NotFound { .. }) {
            warn!(worker_id = %worker.id, error = %e, "failed to refresh registry entry");
            return;
        }

        info!(worker_id = %worker.id, "registry entry expired, registering again");
        if let Err(e) = self
            .registry_call("register", self.registry.register(worker))
            .await
        {
            warn!(worker_id = %worker.id, error = %e, "failed to restore registry entry");
        }
    }

    // ---- assignment ----------------------------------------------------

    /// Places an execution on a worker.
    ///
    /// Idempotent: an execution already mapped to an Active worker gets that
    /// worker back and no load is added. A mapping to a worker that is no
    /// longer Active is dropped and the execution placed afresh.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::NoSuitableWorker`] if no Active worker with spare
    /// capacity carries the required tags.
    #[instrument(skip(self, requirements), fields(execution_id = %execution_id, strategy = ?requirements.strategy))]
    pub async fn assign_work(
        &self,
        execution_id: &ExecutionId,
        requirements: &WorkRequirements,
    ) -> Result<WorkerNode, Report<CoordinatorError>> {
        let placed = {
            let mut state = self.state.write().await;
            if let Some(assignment) = state.assignments.get(execution_id) {
                let live = state
                    .workers
                    .get(&assignment.worker_id)
                    .filter(|w| w.status == WorkerStatus::Active);
                if let Some(worker) = live {
                    return Ok(worker.clone());
                }
            }
            state.release(execution_id);
            state.place(execution_id, requirements)
        };

        let Some(worker) = placed else {
            warn!("no suitable worker");
            return Err(CoordinatorError::NoSuitableWorker {
                execution_id: execution_id.clone(),
            }
            .into());
        };

        debug!(worker_id = %worker.id, load = worker.current_load, "work assigned");
        self.publish(WorkAssigned {
            execution_id: execution_id.clone(),
            worker_id: worker.id.clone(),
        })
        .await;
        Ok(worker)
    }

    /// Places a unit of work using its own requirements.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::assign_work`].
    pub async fn assign_unit(&self, unit: &UnitOfWork) -> Result<WorkerNode, Report<CoordinatorError>> {
        self.assign_work(&unit.execution_id, &unit.requirements).await
    }

    /// Moves every execution mapped to `worker_id` to other workers.
    ///
    /// Executions for which no worker can be found are logged and left
    /// unassigned.
    #[instrument(skip(self), fields(worker_id = %worker_id, reason = %reason))]
    pub async fn reassign_work_from_worker(
        &self,
        worker_id: &WorkerId,
        reason: ReassignReason,
    ) -> ReassignmentSummary {
        let summary = self.state.write().await.reassign_from(worker_id);

        for execution_id in &summary.unassigned {
            error!(execution_id = %execution_id, "no worker available for reassigned execution");
        }
        for (execution_id, to_worker) in &summary.reassigned {
            self.publish(WorkReassigned {
                execution_id: execution_id.clone(),
                from_worker: worker_id.clone(),
                to_worker: to_worker.clone(),
                reason,
            })
            .await;
        }
        if !summary.reassigned.is_empty() {
            info!(moved = summary.reassigned.len(), "work reassigned");
        }
        summary
    }

    /// Records a finished execution: drops its mapping, gives the load back
    /// and folds the outcome into the reporting worker's counters.
    ///
    /// Returns false if the execution was not mapped.
    pub async fn complete_work(&self, completed: &WorkCompleted) -> bool {
        let mut state = self.state.write().await;
        let released = state.release(&completed.execution_id);
        if let Some(worker) = state.workers.get_mut(&completed.worker_id) {
            worker.stats.record(completed.success, completed.duration_ms);
        }

        match &released {
            Some(assignment) if assignment.worker_id != completed.worker_id => debug!(
                execution_id = %completed.execution_id,
                mapped_to = %assignment.worker_id,
                reported_by = %completed.worker_id,
                "completion reported by a different worker"
            ),
            Some(_) => {}
            None => debug!(execution_id = %completed.execution_id, "completion for unmapped execution"),
        }
        released.is_some()
    }

    // ---- health and balance --------------------------------------------

    /// Re-evaluates every worker's status as of `now`.
    ///
    /// Returns the transitions made. Workers that went Offline have their
    /// executions reassigned before this returns.
    pub async fn check_health_at(&self, now: DateTime<Utc>) -> Vec<(WorkerId, WorkerStatus)> {
        let unhealthy_after = self.config.unhealthy_threshold();
        let offline_after = self.config.offline_threshold();

        let transitions: Vec<(WorkerId, WorkerStatus)> = {
            let mut state = self.state.write().await;
            let mut transitions = Vec::new();
            for worker in state.workers.values_mut() {
                let next = worker.evaluate_status(now, unhealthy_after, offline_after);
                if next == worker.status {
                    continue;
                }
                match next {
                    WorkerStatus::Offline => info!(
                        worker_id = %worker.id,
                        from = %worker.status,
                        last_heartbeat = %worker.last_heartbeat,
                        "worker offline"
                    ),
                    WorkerStatus::Unhealthy => warn!(
                        worker_id = %worker.id,
                        last_heartbeat = %worker.last_heartbeat,
                        "worker unhealthy"
                    ),
                    _ => info!(worker_id = %worker.id, to = %next, "worker status changed"),
                }
                worker.status = next;
                transitions.push((worker.id.clone(), next));
            }
            transitions
        };

        for (worker_id, status) in &transitions {
            if *status == WorkerStatus::Offline {
                self.reassign_work_from_worker(worker_id, ReassignReason::WorkerOffline)
                    .await;
            }
        }
        if !transitions.is_empty() {
            self.rebalance_partitions().await;
        }
        transitions
    }

    /// Runs one health check against the wall clock.
    pub async fn check_health(&self) -> Vec<(WorkerId, WorkerStatus)> {
        self.check_health_at(Utc::now()).await
    }

    /// Moves mapped executions from overloaded to underloaded Active workers.
    ///
    /// A worker is overloaded above `average * (1 + threshold)` and
    /// underloaded below `average * (1 - threshold)`, where the average is
    /// total load over total capacity of Active workers. Moves continue
    /// until none is safe. Each move transfers a real partition-map entry
    /// and is published as `work.reassigned`.
    pub async fn rebalance(&self) -> Vec<WorkReassigned> {
        let moves = {
            let mut state = self.state.write().await;
            let (load, capacity) = state
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Active)
                .fold((0u64, 0u64), |(l, c), w| {
                    (l + u64::from(w.current_load), c + u64::from(w.capacity))
                });
            if load == 0 || capacity == 0 {
                return Vec::new();
            }

            let average = load as f64 / capacity as f64;
            let upper = average * (1.0 + self.config.load_imbalance_threshold);
            let lower = average * (1.0 - self.config.load_imbalance_threshold);

            let mut moves = Vec::new();
            for _ in 0..load {
                let Some((execution_id, from, to)) = state.next_rebalance_move(upper, lower) else {
                    break;
                };
                if let Some(assignment) = state.assignments.get_mut(&execution_id) {
                    assignment.worker_id = to.clone();
                }
                if let Some(worker) = state.workers.get_mut(&from) {
                    worker.current_load = worker.current_load.saturating_sub(1);
                }
                if let Some(worker) = state.workers.get_mut(&to) {
                    worker.current_load += 1;
                }
                moves.push(WorkReassigned {
                    execution_id,
                    from_worker: from,
                    to_worker: to,
                    reason: ReassignReason::Rebalance,
                });
            }
            state.reassignments += moves.len() as u64;
            moves
        };

        if !moves.is_empty() {
            info!(moves = moves.len(), "rebalanced load");
        }
        for event in &moves {
            self.publish(event.clone()).await;
        }
        moves
    }

    // ---- bulk distribution ---------------------------------------------

    /// Partitions `items` over the Active workers with the configured strategy.
    pub async fn distribute(&self, items: &[ExecutionId]) -> Vec<Partition> {
        let workers = self.state.read().await.active_worker_ids();
        self.distributor.distribute(items, &workers).await
    }

    async fn rebalance_partitions(&self) {
        if self.distributor.item_count().await == 0 {
            return;
        }
        let workers = self.state.read().await.active_worker_ids();
        self.distributor.rebalance(&workers).await;
    }

    // ---- queries -------------------------------------------------------

    pub async fn worker(&self, worker_id: &WorkerId) -> Option<WorkerNode> {
        self.state.read().await.workers.get(worker_id).cloned()
    }

    /// All known workers, ordered by ID.
    pub async fn workers(&self) -> Vec<WorkerNode> {
        self.state.read().await.workers.values().cloned().collect()
    }

    pub async fn worker_status(&self, worker_id: &WorkerId) -> Option<WorkerStatus> {
        self.state
            .read()
            .await
            .workers
            .get(worker_id)
            .map(|w| w.status)
    }

    /// The worker an execution is mapped to.
    pub async fn assignment(&self, execution_id: &ExecutionId) -> Option<WorkerId> {
        self.state
            .read()
            .await
            .assignments
            .get(execution_id)
            .map(|a| a.worker_id.clone())
    }

    /// Executions mapped to a worker, ordered by ID.
    pub async fn assignments_of(&self, worker_id: &WorkerId) -> Vec<ExecutionId> {
        self.state.read().await.executions_of(worker_id)
    }

    pub async fn metrics(&self) -> CoordinatorMetrics {
        self.state.read().await.metrics(Utc::now())
    }

    // ---- registry reconciliation ---------------------------------------

    /// Loads the fleet from the registry. Failure is logged and leaves the
    /// worker set as it was.
    async fn load_from_registry(&self) {
        let listed = match self.registry_call("list", self.registry.list()).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "registry unavailable at startup, starting with no workers");
                return;
            }
        };

        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut loaded = 0;
        for mut worker in listed {
            if state.workers.contains_key(&worker.id) {
                continue;
            }
            worker.status = WorkerStatus::Active;
            worker.current_load = 0;
            worker.last_heartbeat = now;
            state.workers.insert(worker.id.clone(), worker);
            loaded += 1;
        }
        info!(workers = loaded, "loaded workers from registry");
    }

    async fn handle_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(record) | RegistryEvent::Updated(record) => {
                let joined = {
                    let mut state = self.state.write().await;
                    match state.workers.get_mut(&record.id) {
                        Some(known) => {
                            known.address = record.address;
                            known.capacity = record.capacity;
                            known.tags = record.tags;
                            let revived = known.status == WorkerStatus::Offline
                                && record.registered_at > known.registered_at;
                            if revived {
                                known.status = WorkerStatus::Active;
                                known.registered_at = record.registered_at;
                                known.last_heartbeat = Utc::now();
                                known.reported_healthy = true;
                            }
                            revived
                        }
                        None => {
                            let mut worker = record;
                            worker.status = WorkerStatus::Active;
                            worker.current_load = 0;
                            worker.last_heartbeat = Utc::now();
                            state.workers.insert(worker.id.clone(), worker);
                            true
                        }
                    }
                };
                if joined {
                    info!("worker joined via registry");
                    self.rebalance_partitions().await;
                }
            }
            RegistryEvent::Removed(worker_id) => {
                // An expired entry only means missed refreshes; the health
                // check decides when the worker is gone. Offline workers have
                // already lost their work and are forgotten here.
                let mut state = self.state.write().await;
                match state.workers.get(&worker_id).map(|w| w.status) {
                    Some(WorkerStatus::Offline) => {
                        state.workers.remove(&worker_id);
                        info!(worker_id = %worker_id, "offline worker left registry");
                    }
                    Some(status) => {
                        debug!(worker_id = %worker_id, %status, "registry entry gone, leaving worker to health check");
                    }
                    None => {}
                }
            }
        }
    }

    async fn handle_event(&self, event: CoordinationEvent) {
        match event {
            CoordinationEvent::WorkerHeartbeat(heartbeat) => {
                if let Err(e) = self.heartbeat(&heartbeat).await {
                    warn!(worker_id = %heartbeat.worker_id, error = %e, "heartbeat rejected");
                }
            }
            CoordinationEvent::WorkCompleted(completed) => {
                self.complete_work(&completed).await;
            }
            other => trace!(topic = %other.topic(), "ignoring event"),
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Loads the fleet from the registry and starts the background loops.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::Startup`] if subscribing to the event bus fails.
    /// An unreachable registry is not an error.
    pub async fn start(self: &Arc<Self>) -> Result<(), Report<CoordinatorError>> {
        let registry_events = self.registry.subscribe();
        self.load_from_registry().await;

        let events = self
            .bus
            .subscribe(&[Topic::WorkerHeartbeat, Topic::WorkCompleted])
            .await
            .context(CoordinatorError::Startup)?;

        let mut tasks = self.tasks.lock().await;

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run_health_loop().await }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run_rebalance_loop().await }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run_metrics_loop().await }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run_event_loop(events).await }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            this.run_registry_loop(registry_events).await
        }));

        info!(
            health_check_interval = ?self.config.health_check_interval(),
            rebalance_interval = ?self.config.rebalance_interval(),
            partition_strategy = self.distributor.strategy_name(),
            "coordinator started"
        );
        Ok(())
    }

    /// Stops the background loops, waiting at most the configured timeout.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let timeout = self.config.shutdown_timeout();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "background loops did not stop in time");
        }
        info!("coordinator stopped");
    }

    fn ticker(period: Duration) -> Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    async fn run_health_loop(&self) {
        let mut ticker = Self::ticker(self.config.health_check_interval());
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_health().await;
                }
            }
        }
        debug!("health loop stopped");
    }

    async fn run_rebalance_loop(&self) {
        let mut ticker = Self::ticker(self.config.rebalance_interval());
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.rebalance().await;
                }
            }
        }
        debug!("rebalance loop stopped");
    }

    async fn run_metrics_loop(&self) {
        let mut ticker = Self::ticker(self.config.metrics_interval());
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let metrics = self.metrics().await;
                    debug!(
                        active = metrics.active_workers,
                        load_ratio = metrics.load_ratio,
                        assignments = metrics.active_assignments,
                        "metrics snapshot"
                    );
                    self.publish(metrics).await;
                }
            }
        }
        debug!("metrics loop stopped");
    }

    async fn run_event_loop(&self, mut events: EventStream) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("event subscription closed");
                        break;
                    }
                },
            }
        }
        debug!("event loop stopped");
    }

    async fn run_registry_loop(&self, mut events: broadcast::Receiver<RegistryEvent>) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.handle_registry_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "registry events dropped, next poll will reconcile");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("registry loop stopped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("distributor", &self.distributor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::config::RegistryConfig;
    use crate::registry::MemoryRegistryBackend;
    use chrono::TimeDelta;

    struct Harness {
        coordinator: Arc<Coordinator>,
        bus: InMemoryEventBus,
        registry: Arc<WorkerRegistry>,
    }

    fn harness() -> Harness {
        let bus = InMemoryEventBus::new();
        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(MemoryRegistryBackend::new()),
            RegistryConfig::default(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            registry.clone(),
            Arc::new(bus.clone()),
        ));
        Harness {
            coordinator,
            bus,
            registry,
        }
    }

    fn exec(id: &str) -> ExecutionId {
        ExecutionId::from(id)
    }

    fn heartbeat(worker: &str, load: u32, at: DateTime<Utc>) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: WorkerId::from(worker),
            load,
            completed: 0,
            failed: 0,
            avg_duration_ms: 0.0,
            healthy: true,
            timestamp: at,
        }
    }

    async fn register(coordinator: &Coordinator, id: &str, capacity: u32) -> WorkerNode {
        coordinator
            .register_worker(WorkerNode::new(id, format!("{id}.local:7000"), capacity))
            .await
            .expect("register")
    }

    async fn total_load(coordinator: &Coordinator) -> u32 {
        coordinator
            .workers()
            .await
            .iter()
            .map(|w| w.current_load)
            .sum()
    }

    #[tokio::test]
    async fn least_loaded_skips_full_worker() {
        let h = harness();
        register(&h.coordinator, "w1", 2).await;
        register(&h.coordinator, "w2", 2).await;
        h.coordinator
            .heartbeat(&heartbeat("w1", 2, Utc::now()))
            .await
            .expect("heartbeat");

        let worker = h
            .coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned");
        assert_eq!(worker.id.as_str(), "w2");
    }

    #[tokio::test]
    async fn assign_is_idempotent() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        register(&h.coordinator, "w2", 4).await;
        let requirements = WorkRequirements::default();

        let first = h
            .coordinator
            .assign_work(&exec("e1"), &requirements)
            .await
            .expect("first");
        let second = h
            .coordinator
            .assign_work(&exec("e1"), &requirements)
            .await
            .expect("second");

        assert_eq!(first.id, second.id);
        assert_eq!(first.current_load, 1);
        assert_eq!(second.current_load, 1);
        assert_eq!(total_load(&h.coordinator).await, 1);
        assert_eq!(h.coordinator.metrics().await.distributed_work, 1);
    }

    #[tokio::test]
    async fn no_suitable_worker_when_fleet_is_full() {
        let h = harness();
        register(&h.coordinator, "w1", 1).await;
        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("first fits");

        let report = h
            .coordinator
            .assign_work(&exec("e2"), &WorkRequirements::default())
            .await
            .unwrap_err();
        assert_eq!(
            report.current_context(),
            &CoordinatorError::NoSuitableWorker {
                execution_id: exec("e2")
            }
        );
    }

    #[tokio::test]
    async fn required_tags_filter_candidates() {
        let h = harness();
        register(&h.coordinator, "cpu", 4).await;
        h.coordinator
            .register_worker(WorkerNode::new("gpu", "gpu.local:7000", 4).with_tags(["gpu"]))
            .await
            .expect("register");

        let requirements = WorkRequirements::default().with_tags(["gpu"]);
        for n in 0..3 {
            let worker = h
                .coordinator
                .assign_work(&exec(&format!("e{n}")), &requirements)
                .await
                .expect("assigned");
            assert_eq!(worker.id.as_str(), "gpu");
        }
    }

    #[tokio::test]
    async fn affinity_routes_same_key_to_same_worker() {
        let h = harness();
        for id in ["w1", "w2", "w3"] {
            register(&h.coordinator, id, 10).await;
        }
        let requirements = WorkRequirements::affinity("tenant-42");
        let first = h
            .coordinator
            .assign_work(&exec("e1"), &requirements)
            .await
            .expect("assigned");
        let second = h
            .coordinator
            .assign_work(&exec("e2"), &requirements)
            .await
            .expect("assigned");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn unregister_moves_every_execution() {
        let h = harness();
        for id in ["w1", "w2", "w3"] {
            register(&h.coordinator, id, 4).await;
        }
        let round_robin = WorkRequirements::with_strategy(SelectionStrategy::RoundRobin);
        for n in 0..6 {
            h.coordinator
                .assign_work(&exec(&format!("e{n}")), &round_robin)
                .await
                .expect("assigned");
        }
        let departing = WorkerId::from("w2");
        assert_eq!(h.coordinator.assignments_of(&departing).await.len(), 2);
        let before = total_load(&h.coordinator).await;

        let summary = h
            .coordinator
            .unregister_worker(&departing)
            .await
            .expect("unregister");

        assert_eq!(summary.reassigned.len(), 2);
        assert!(summary.unassigned.is_empty());
        assert!(h.coordinator.worker(&departing).await.is_none());
        assert!(h.coordinator.assignments_of(&departing).await.is_empty());
        for n in 0..6 {
            let owner = h.coordinator.assignment(&exec(&format!("e{n}"))).await;
            assert!(owner.is_some_and(|w| w != departing));
        }
        let after = total_load(&h.coordinator).await;
        assert_eq!(after as usize, before as usize - summary.unassigned.len());
        assert!(h.registry.get(&departing).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn unregister_unknown_worker_fails() {
        let h = harness();
        let report = h
            .coordinator
            .unregister_worker(&WorkerId::from("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(
            report.current_context(),
            CoordinatorError::UnknownWorker { .. }
        ));
    }

    #[tokio::test]
    async fn silent_worker_goes_offline_and_loses_work() {
        let h = harness();
        register(&h.coordinator, "w2", 4).await;
        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned");
        register(&h.coordinator, "w1", 4).await;
        register(&h.coordinator, "w3", 4).await;
        assert_eq!(
            h.coordinator.assignment(&exec("e1")).await,
            Some(WorkerId::from("w2"))
        );

        // w1 and w3 keep heartbeating; w2 goes quiet for 65s.
        let now = Utc::now() + TimeDelta::seconds(65);
        let received = now - TimeDelta::seconds(5);
        for id in ["w1", "w3"] {
            h.coordinator
                .heartbeat_at(&heartbeat(id, 0, received), received)
                .await
                .expect("heartbeat");
        }

        let transitions = h.coordinator.check_health_at(now).await;
        assert_eq!(
            transitions,
            vec![(WorkerId::from("w2"), WorkerStatus::Offline)]
        );
        assert_eq!(
            h.coordinator.worker_status(&WorkerId::from("w2")).await,
            Some(WorkerStatus::Offline)
        );
        let owner = h.coordinator.assignment(&exec("e1")).await.expect("remapped");
        assert!(owner.as_str() == "w1" || owner.as_str() == "w3");
        assert_eq!(h.coordinator.metrics().await.reassignments, 1);
    }

    #[tokio::test]
    async fn unhealthy_worker_is_skipped_then_recovers() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;

        let mut sick = heartbeat("w1", 0, Utc::now());
        sick.healthy = false;
        let status = h.coordinator.heartbeat(&sick).await.expect("heartbeat");
        assert_eq!(status, WorkerStatus::Unhealthy);
        assert!(
            h.coordinator
                .assign_work(&exec("e1"), &WorkRequirements::default())
                .await
                .is_err()
        );

        let status = h
            .coordinator
            .heartbeat(&heartbeat("w1", 0, Utc::now()))
            .await
            .expect("heartbeat");
        assert_eq!(status, WorkerStatus::Active);
        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned after recovery");
    }

    #[tokio::test]
    async fn silence_past_unhealthy_threshold_then_heartbeat() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;

        let later = Utc::now() + TimeDelta::seconds(40);
        let transitions = h.coordinator.check_health_at(later).await;
        assert_eq!(transitions, vec![(WorkerId::from("w1"), WorkerStatus::Unhealthy)]);

        h.coordinator
            .heartbeat_at(&heartbeat("w1", 0, later), later)
            .await
            .expect("heartbeat");
        assert!(h.coordinator.check_health_at(later).await.is_empty());
        assert_eq!(
            h.coordinator.worker_status(&WorkerId::from("w1")).await,
            Some(WorkerStatus::Active)
        );
    }

    #[tokio::test]
    async fn offline_worker_heartbeat_is_ignored_until_reregistered() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        let later = Utc::now() + TimeDelta::seconds(90);
        h.coordinator.check_health_at(later).await;

        let status = h
            .coordinator
            .heartbeat(&heartbeat("w1", 0, later))
            .await
            .expect("heartbeat");
        assert_eq!(status, WorkerStatus::Offline);

        let worker = register(&h.coordinator, "w1", 4).await;
        assert_eq!(worker.status, WorkerStatus::Active);
    }

    #[tokio::test]
    async fn completion_releases_load_and_counts() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned");

        let released = h
            .coordinator
            .complete_work(&WorkCompleted {
                execution_id: exec("e1"),
                worker_id: WorkerId::from("w1"),
                success: true,
                duration_ms: 250,
                error: None,
            })
            .await;
        assert!(released);
        assert_eq!(h.coordinator.assignment(&exec("e1")).await, None);

        let worker = h.coordinator.worker(&WorkerId::from("w1")).await.expect("known");
        assert_eq!(worker.current_load, 0);
        assert_eq!(worker.stats.completed, 1);
        assert!((worker.stats.avg_duration_ms - 250.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rebalance_migrates_mapped_executions() {
        let h = harness();
        register(&h.coordinator, "w1", 10).await;
        for n in 1..=6 {
            h.coordinator
                .assign_work(&exec(&format!("e{n}")), &WorkRequirements::default())
                .await
                .expect("assigned");
        }
        register(&h.coordinator, "w2", 10).await;

        let moves = h.coordinator.rebalance().await;
        let moved: Vec<&str> = moves.iter().map(|m| m.execution_id.as_str()).collect();
        assert_eq!(moved, vec!["e1", "e2", "e3"]);

        let w1 = WorkerId::from("w1");
        let w2 = WorkerId::from("w2");
        assert_eq!(h.coordinator.assignments_of(&w1).await.len(), 3);
        assert_eq!(h.coordinator.assignments_of(&w2).await.len(), 3);
        assert_eq!(h.coordinator.worker(&w1).await.expect("w1").current_load, 3);
        assert_eq!(h.coordinator.worker(&w2).await.expect("w2").current_load, 3);

        // Balanced now: a second pass has nothing to do.
        assert!(h.coordinator.rebalance().await.is_empty());
    }

    #[tokio::test]
    async fn metrics_count_workers_by_status() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        register(&h.coordinator, "w2", 6).await;
        let mut sick = heartbeat("w2", 0, Utc::now());
        sick.healthy = false;
        h.coordinator.heartbeat(&sick).await.expect("heartbeat");
        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned");

        let metrics = h.coordinator.metrics().await;
        assert_eq!(metrics.total_workers, 2);
        assert_eq!(metrics.count(WorkerStatus::Active), 1);
        assert_eq!(metrics.count(WorkerStatus::Unhealthy), 1);
        assert_eq!(metrics.total_capacity, 4);
        assert_eq!(metrics.total_load, 1);
        assert!((metrics.load_ratio - 0.25).abs() < 1e-9);
        assert_eq!(metrics.active_assignments, 1);
        assert!(CoordinationEvent::from(metrics).validate().is_ok());
    }

    #[tokio::test]
    async fn assignment_is_published() {
        let h = harness();
        let mut events = h.bus.subscribe(&[Topic::WorkAssigned]).await.expect("subscribe");
        register(&h.coordinator, "w1", 4).await;

        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned");
        let event = events.next().await.expect("event");
        assert_eq!(
            event,
            CoordinationEvent::WorkAssigned(WorkAssigned {
                execution_id: exec("e1"),
                worker_id: WorkerId::from("w1"),
            })
        );
    }

    async fn apply_registry_events(h: &Harness, events: &mut broadcast::Receiver<RegistryEvent>) {
        while let Ok(event) = events.try_recv() {
            h.coordinator.handle_registry_event(event).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_registry_entry_leaves_worker_to_health_check() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        register(&h.coordinator, "w2", 4).await;
        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned");
        let mut events = h.registry.subscribe();

        // Both entries outlive their 30s TTL without a refresh.
        tokio::time::advance(Duration::from_secs(35)).await;
        h.registry.reconcile().await.expect("reconcile");
        apply_registry_events(&h, &mut events).await;

        for id in ["w1", "w2"] {
            assert_eq!(
                h.coordinator.worker_status(&WorkerId::from(id)).await,
                Some(WorkerStatus::Active)
            );
        }
        assert_eq!(
            h.coordinator.assignment(&exec("e1")).await,
            Some(WorkerId::from("w1"))
        );

        let status = h
            .coordinator
            .heartbeat(&heartbeat("w1", 1, Utc::now()))
            .await
            .expect("heartbeat");
        assert_eq!(status, WorkerStatus::Active);
        assert!(h.registry.get(&WorkerId::from("w1")).await.expect("get").is_some());
        assert!(
            h.coordinator
                .worker(&WorkerId::from("w2"))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn offline_worker_is_forgotten_when_registry_drops_it() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        h.coordinator
            .check_health_at(Utc::now() + TimeDelta::seconds(90))
            .await;
        assert_eq!(
            h.coordinator.worker_status(&WorkerId::from("w1")).await,
            Some(WorkerStatus::Offline)
        );

        h.coordinator
            .handle_registry_event(RegistryEvent::Removed(WorkerId::from("w1")))
            .await;
        assert!(h.coordinator.worker(&WorkerId::from("w1")).await.is_none());
    }

    #[tokio::test]
    async fn registry_removal_of_live_worker_keeps_its_work() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        h.coordinator
            .assign_work(&exec("e1"), &WorkRequirements::default())
            .await
            .expect("assigned");
        register(&h.coordinator, "w2", 4).await;

        h.coordinator
            .handle_registry_event(RegistryEvent::Removed(WorkerId::from("w1")))
            .await;

        assert_eq!(
            h.coordinator.worker_status(&WorkerId::from("w1")).await,
            Some(WorkerStatus::Active)
        );
        assert_eq!(
            h.coordinator.assignment(&exec("e1")).await,
            Some(WorkerId::from("w1"))
        );

        // Only the health check takes the work away.
        h.coordinator
            .check_health_at(Utc::now() + TimeDelta::seconds(65))
            .await;
        assert_eq!(
            h.coordinator.worker_status(&WorkerId::from("w1")).await,
            Some(WorkerStatus::Offline)
        );
    }

    #[tokio::test]
    async fn registry_addition_discovers_worker() {
        let h = harness();
        h.coordinator
            .handle_registry_event(RegistryEvent::Added(
                WorkerNode::new("remote", "10.0.0.9:7000", 3).with_load(2),
            ))
            .await;

        let worker = h
            .coordinator
            .worker(&WorkerId::from("remote"))
            .await
            .expect("discovered");
        assert_eq!(worker.status, WorkerStatus::Active);
        assert_eq!(worker.current_load, 0);
    }

    #[tokio::test]
    async fn distribute_spreads_over_active_workers() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        register(&h.coordinator, "w2", 4).await;

        let items: Vec<ExecutionId> = (0..50).map(|n| exec(&format!("batch-{n}"))).collect();
        let partitions = h.coordinator.distribute(&items).await;
        assert_eq!(partitions.iter().map(|p| p.items.len()).sum::<usize>(), 50);

        h.coordinator
            .unregister_worker(&WorkerId::from("w2"))
            .await
            .expect("unregister");
        let partitions = h.coordinator.distributor().partitions().await;
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].worker_id.as_str(), "w1");
        assert_eq!(partitions[0].items.len(), 50);
    }

    #[tokio::test]
    async fn bulk_items_return_when_worker_recovers() {
        let h = harness();
        register(&h.coordinator, "w1", 4).await;
        let items: Vec<ExecutionId> = (0..10).map(|n| exec(&format!("batch-{n}"))).collect();
        h.coordinator.distribute(&items).await;

        let later = Utc::now() + TimeDelta::seconds(40);
        let transitions = h.coordinator.check_health_at(later).await;
        assert_eq!(transitions, vec![(WorkerId::from("w1"), WorkerStatus::Unhealthy)]);
        assert!(h.coordinator.distributor().partitions().await.is_empty());
        assert_eq!(h.coordinator.distributor().item_count().await, 10);

        let status = h
            .coordinator
            .heartbeat_at(&heartbeat("w1", 0, later), later)
            .await
            .expect("heartbeat");
        assert_eq!(status, WorkerStatus::Active);

        let partitions = h.coordinator.distributor().partitions().await;
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].worker_id.as_str(), "w1");
        assert_eq!(partitions[0].items.len(), 10);
        assert!(h.coordinator.distributor().pending().await.is_empty());
    }

    #[tokio::test]
    async fn last_seen_uses_receive_time_not_worker_clock() {
        let h = harness();
        register(&h.coordinator, "slow", 4).await;
        register(&h.coordinator, "fast", 4).await;
        let start = Utc::now();
        let received = start + TimeDelta::seconds(50);

        // One clock lags two minutes, the other runs five minutes ahead.
        h.coordinator
            .heartbeat_at(
                &heartbeat("slow", 0, received - TimeDelta::seconds(120)),
                received,
            )
            .await
            .expect("heartbeat");
        h.coordinator
            .heartbeat_at(
                &heartbeat("fast", 0, received + TimeDelta::seconds(300)),
                received,
            )
            .await
            .expect("heartbeat");

        assert!(
            h.coordinator
                .check_health_at(start + TimeDelta::seconds(61))
                .await
                .is_empty()
        );

        let transitions = h
            .coordinator
            .check_health_at(received + TimeDelta::seconds(61))
            .await;
        assert_eq!(
            transitions,
            vec![
                (WorkerId::from("fast"), WorkerStatus::Offline),
                (WorkerId::from("slow"), WorkerStatus::Offline),
            ]
        );
    }

    #[tokio::test]
    async fn rebalance_respects_required_tags() {
        let h = harness();
        h.coordinator
            .register_worker(WorkerNode::new("gpu", "gpu.local:7000", 10).with_tags(["gpu"]))
            .await
            .expect("register");
        let gpu_only = WorkRequirements::default().with_tags(["gpu"]);
        for n in 0..6 {
            h.coordinator
                .assign_work(&exec(&format!("e{n}")), &gpu_only)
                .await
                .expect("assigned");
        }
        register(&h.coordinator, "cpu", 10).await;

        assert!(h.coordinator.rebalance().await.is_empty());
        assert_eq!(h.coordinator.assignments_of(&WorkerId::from("gpu")).await.len(), 6);
        assert!(h.coordinator.assignments_of(&WorkerId::from("cpu")).await.is_empty());
    }

    #[tokio::test]
    async fn rebalance_moves_only_untagged_work_to_plain_worker() {
        let h = harness();
        h.coordinator
            .register_worker(WorkerNode::new("gpu", "gpu.local:7000", 10).with_tags(["gpu"]))
            .await
            .expect("register");
        let gpu_only = WorkRequirements::default().with_tags(["gpu"]);
        for n in 0..3 {
            h.coordinator
                .assign_work(&exec(&format!("g{n}")), &gpu_only)
                .await
                .expect("assigned");
            h.coordinator
                .assign_work(&exec(&format!("p{n}")), &WorkRequirements::default())
                .await
                .expect("assigned");
        }
        register(&h.coordinator, "cpu", 10).await;

        let moves = h.coordinator.rebalance().await;
        let moved: Vec<&str> = moves.iter().map(|m| m.execution_id.as_str()).collect();
        assert_eq!(moved, vec!["p0", "p1", "p2"]);
        assert!(moves.iter().all(|m| m.to_worker.as_str() == "cpu"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_by_timeout() {
        let h = harness();
        h.coordinator.start().await.expect("start");
        let stuck = tokio::spawn(std::future::pending::<()>());
        let abort = stuck.abort_handle();
        h.coordinator.tasks.lock().await.push(stuck);

        let started = tokio::time::Instant::now();
        h.coordinator.shutdown().await;
        let waited = started.elapsed();
        let timeout = h.coordinator.config().shutdown_timeout();
        assert!(waited >= timeout);
        assert!(waited < timeout + Duration::from_secs(1));
        assert!(h.coordinator.tasks.lock().await.is_empty());
        abort.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_returns_once_loops_exit() {
        let h = harness();
        h.coordinator.start().await.expect("start");
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        h.coordinator.shutdown().await;
        assert!(started.elapsed() < h.coordinator.config().shutdown_timeout());
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let h = harness();
        let report = h
            .coordinator
            .register_worker(WorkerNode::new("w1", "a", 0))
            .await
            .unwrap_err();
        assert!(matches!(
            report.current_context(),
            CoordinatorError::InvalidWorker { .. }
        ));
    }

    #[tokio::test]
    async fn background_loops_ingest_bus_events() {
        let h = harness();
        register(&h.coordinator, "w1", 8).await;
        h.coordinator.start().await.expect("start");

        h.bus
            .publish(heartbeat("w1", 5, Utc::now()).into())
            .await
            .expect("publish");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let load = h
                .coordinator
                .worker(&WorkerId::from("w1"))
                .await
                .map(|w| w.current_load);
            if load == Some(5) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "heartbeat not applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.coordinator.shutdown().await;
    }
}
