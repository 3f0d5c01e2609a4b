//! Bulk work distribution over partition strategies.

use crate::partition::{PartitionMap, PartitionStrategy};
use chrono::{DateTime, Utc};
use flowgrid_core::{ExecutionId, PartitionId, WorkerId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A batch of work items owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub worker_id: WorkerId,
    pub items: Vec<ExecutionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Partition {
    fn new(worker_id: WorkerId, items: Vec<ExecutionId>, now: DateTime<Utc>) -> Self {
        Self {
            id: PartitionId::new(),
            worker_id,
            items,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default)]
struct Placement {
    partitions: Vec<Partition>,
    /// Items waiting for a worker; placed by the next `rebalance` that has one.
    pending: Vec<ExecutionId>,
}

/// Holds the current partitions and recomputes them through a strategy.
///
/// Partitions are replaced wholesale by `distribute` and `rebalance`; they
/// are never edited in place. With no workers the items are held as pending
/// rather than dropped.
pub struct WorkDistributor {
    strategy: Box<dyn PartitionStrategy>,
    placement: RwLock<Placement>,
}

impl WorkDistributor {
    #[must_use]
    pub fn new(strategy: Box<dyn PartitionStrategy>) -> Self {
        Self {
            strategy,
            placement: RwLock::new(Placement::default()),
        }
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Partitions `items` over `workers`, replacing the current partitions.
    pub async fn distribute(&self, items: &[ExecutionId], workers: &[WorkerId]) -> Vec<Partition> {
        let mut placement = self.placement.write().await;
        if workers.is_empty() {
            warn!(items = items.len(), "no workers, holding items as pending");
            *placement = Placement {
                partitions: Vec::new(),
                pending: items.to_vec(),
            };
            return Vec::new();
        }

        let partitions = Self::materialize(self.strategy.partition(items, workers));
        debug!(
            strategy = self.strategy.name(),
            items = items.len(),
            partitions = partitions.len(),
            "distributed work"
        );

        *placement = Placement {
            partitions: partitions.clone(),
            pending: Vec::new(),
        };
        partitions
    }

    /// Recomputes the current partitions for a new worker set.
    ///
    /// Pending items are placed along with the partitioned ones. With no
    /// workers every item becomes pending.
    pub async fn rebalance(&self, workers: &[WorkerId]) -> Vec<Partition> {
        let mut placement = self.placement.write().await;

        if workers.is_empty() {
            let partitions = std::mem::take(&mut placement.partitions);
            for partition in partitions {
                placement.pending.extend(partition.items);
            }
            if !placement.pending.is_empty() {
                warn!(
                    pending = placement.pending.len(),
                    "no workers, holding items as pending"
                );
            }
            return Vec::new();
        }

        let mut current = PartitionMap::new();
        for partition in &placement.partitions {
            current
                .entry(partition.worker_id.clone())
                .or_default()
                .extend(partition.items.iter().cloned());
        }
        let mut partitions = Self::materialize(self.strategy.rebalance(&current, workers));

        let pending = std::mem::take(&mut placement.pending);
        if !pending.is_empty() {
            let placed = Self::materialize(self.strategy.partition(&pending, workers));
            debug!(items = pending.len(), "placed pending items");
            partitions = Self::merge(partitions, placed);
        }
        debug!(
            strategy = self.strategy.name(),
            workers = workers.len(),
            partitions = partitions.len(),
            "rebalanced partitions"
        );

        placement.partitions = partitions.clone();
        partitions
    }

    /// Finds the partition holding `item`.
    pub async fn get_partition_for_work(&self, item: &ExecutionId) -> Option<Partition> {
        self.placement
            .read()
            .await
            .partitions
            .iter()
            .find(|p| p.items.contains(item))
            .cloned()
    }

    pub async fn partitions(&self) -> Vec<Partition> {
        self.placement.read().await.partitions.clone()
    }

    /// Items held until a worker is available.
    pub async fn pending(&self) -> Vec<ExecutionId> {
        self.placement.read().await.pending.clone()
    }

    /// Items in partitions plus pending items.
    pub async fn item_count(&self) -> usize {
        let placement = self.placement.read().await;
        placement.pending.len() + placement.partitions.iter().map(|p| p.items.len()).sum::<usize>()
    }

    fn materialize(map: PartitionMap) -> Vec<Partition> {
        let now = Utc::now();
        map.into_iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(worker_id, items)| Partition::new(worker_id, items, now))
            .collect()
    }

    /// Folds `extra` into `partitions`, one partition per worker.
    fn merge(mut partitions: Vec<Partition>, extra: Vec<Partition>) -> Vec<Partition> {
        for partition in extra {
            match partitions.iter_mut().find(|p| p.worker_id == partition.worker_id) {
                Some(existing) => existing.items.extend(partition.items),
                None => partitions.push(partition),
            }
        }
        partitions
    }
}

impl std::fmt::Debug for WorkDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkDistributor")
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}
