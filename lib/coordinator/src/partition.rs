//! Partition strategies for bulk work distribution.
//!
//! A strategy maps work items onto workers. Every strategy returns an entry
//! for every worker it was given, possibly empty, and preserves input order
//! within each worker's list.

use crate::config::PartitionStrategyKind;
use flowgrid_core::{ExecutionId, WorkerId};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Work items grouped by the worker responsible for them.
pub type PartitionMap = BTreeMap<WorkerId, Vec<ExecutionId>>;

/// Stable 64-bit hash of a string: the first eight bytes of its SHA-256.
#[must_use]
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Maps work items to workers.
pub trait PartitionStrategy: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Assigns `items` to `workers`. Returns an empty map if there are no workers.
    fn partition(&self, items: &[ExecutionId], workers: &[WorkerId]) -> PartitionMap;

    /// Recomputes an existing mapping for a new worker set.
    ///
    /// The default re-partitions every item currently held; items are taken
    /// in worker-ID order, then in their existing order.
    fn rebalance(&self, current: &PartitionMap, workers: &[WorkerId]) -> PartitionMap {
        let items: Vec<ExecutionId> = current.values().flatten().cloned().collect();
        self.partition(&items, workers)
    }
}

/// Builds the strategy named by configuration.
#[must_use]
pub fn strategy_for(kind: PartitionStrategyKind, virtual_nodes: usize) -> Box<dyn PartitionStrategy> {
    match kind {
        PartitionStrategyKind::ConsistentHash => Box::new(ConsistentHash::new(virtual_nodes)),
        PartitionStrategyKind::Range => Box::new(RangePartition),
        PartitionStrategyKind::Hash => Box::new(ModuloHash),
    }
}

fn empty_map(workers: &[WorkerId]) -> PartitionMap {
    workers.iter().map(|w| (w.clone(), Vec::new())).collect()
}

/// Consistent hashing over a ring of virtual nodes.
///
/// Each worker is placed on the ring `replicas` times at
/// `hash("{worker}:{replica}")`. An item belongs to the first ring entry at
/// or after its own hash, wrapping to the smallest entry.
#[derive(Debug, Clone)]
pub struct ConsistentHash {
    replicas: usize,
}

impl ConsistentHash {
    pub const DEFAULT_REPLICAS: usize = 100;

    #[must_use]
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
        }
    }

    fn ring(&self, workers: &[WorkerId]) -> BTreeMap<u64, WorkerId> {
        let mut sorted: Vec<&WorkerId> = workers.iter().collect();
        sorted.sort();

        let mut ring = BTreeMap::new();
        for worker in sorted {
            for replica in 0..self.replicas {
                ring.insert(stable_hash(&format!("{worker}:{replica}")), worker.clone());
            }
        }
        ring
    }

    fn locate<'r>(ring: &'r BTreeMap<u64, WorkerId>, item: &ExecutionId) -> Option<&'r WorkerId> {
        let hash = stable_hash(item.as_str());
        ring.range(hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, worker)| worker)
    }
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new(Self::DEFAULT_REPLICAS)
    }
}

impl PartitionStrategy for ConsistentHash {
    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn partition(&self, items: &[ExecutionId], workers: &[WorkerId]) -> PartitionMap {
        let ring = self.ring(workers);
        let mut map = empty_map(workers);
        for item in items {
            let bucket = Self::locate(&ring, item).and_then(|worker| map.get_mut(worker));
            if let Some(bucket) = bucket {
                bucket.push(item.clone());
            }
        }
        map
    }
}

/// Contiguous chunks in input order; the last worker takes the remainder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangePartition;

impl PartitionStrategy for RangePartition {
    fn name(&self) -> &'static str {
        "range"
    }

    fn partition(&self, items: &[ExecutionId], workers: &[WorkerId]) -> PartitionMap {
        let mut map = empty_map(workers);
        if workers.is_empty() {
            return map;
        }

        let chunk = items.len() / workers.len();
        let last = workers.len() - 1;
        for (index, worker) in workers.iter().enumerate() {
            let start = index * chunk;
            let end = if index == last { items.len() } else { start + chunk };
            if let Some(bucket) = map.get_mut(worker) {
                bucket.extend_from_slice(&items[start..end]);
            }
        }
        map
    }
}

/// `hash(item) mod worker_count` over the workers sorted by ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuloHash;

impl PartitionStrategy for ModuloHash {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn partition(&self, items: &[ExecutionId], workers: &[WorkerId]) -> PartitionMap {
        let mut map = empty_map(workers);
        if workers.is_empty() {
            return map;
        }

        let mut sorted: Vec<&WorkerId> = workers.iter().collect();
        sorted.sort();
        for item in items {
            let index = (stable_hash(item.as_str()) % sorted.len() as u64) as usize;
            if let Some(bucket) = map.get_mut(sorted[index]) {
                bucket.push(item.clone());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn items(n: usize) -> Vec<ExecutionId> {
        (0..n).map(|i| ExecutionId::new(format!("item-{i}"))).collect()
    }

    fn workers(n: usize) -> Vec<WorkerId> {
        (1..=n).map(|i| WorkerId::new(format!("w{i}"))).collect()
    }

    fn owners(map: &PartitionMap) -> HashMap<ExecutionId, WorkerId> {
        map.iter()
            .flat_map(|(w, items)| items.iter().map(move |i| (i.clone(), w.clone())))
            .collect()
    }

    fn total(map: &PartitionMap) -> usize {
        map.values().map(Vec::len).sum()
    }

    #[test]
    fn every_strategy_places_every_item_once() {
        let items = items(250);
        let workers = workers(4);
        let strategies: Vec<Box<dyn PartitionStrategy>> = vec![
            Box::new(ConsistentHash::default()),
            Box::new(RangePartition),
            Box::new(ModuloHash),
        ];
        for strategy in strategies {
            let map = strategy.partition(&items, &workers);
            assert_eq!(total(&map), items.len(), "{}", strategy.name());
            assert_eq!(owners(&map).len(), items.len(), "{}", strategy.name());
            assert_eq!(map.len(), workers.len(), "{}", strategy.name());
        }
    }

    #[test]
    fn no_workers_yields_empty_map() {
        let items = items(10);
        assert!(ConsistentHash::default().partition(&items, &[]).is_empty());
        assert!(RangePartition.partition(&items, &[]).is_empty());
        assert!(ModuloHash.partition(&items, &[]).is_empty());
    }

    #[test]
    fn range_chunks_in_order_with_remainder_last() {
        let items = items(10);
        let workers = workers(3);
        let map = RangePartition.partition(&items, &workers);

        assert_eq!(map[&WorkerId::from("w1")], items[0..3].to_vec());
        assert_eq!(map[&WorkerId::from("w2")], items[3..6].to_vec());
        assert_eq!(map[&WorkerId::from("w3")], items[6..10].to_vec());
    }

    #[test]
    fn consistent_hash_is_deterministic() {
        let items = items(100);
        let strategy = ConsistentHash::default();
        let mut reversed = workers(3);
        reversed.reverse();
        assert_eq!(
            strategy.partition(&items, &workers(3)),
            strategy.partition(&items, &reversed)
        );
    }

    #[test]
    fn consistent_hash_adding_worker_moves_few_items() {
        let items = items(1000);
        let strategy = ConsistentHash::default();
        let before = strategy.partition(&items, &workers(4));
        let after = strategy.rebalance(&before, &workers(5));

        let old = owners(&before);
        let new = owners(&after);
        assert_eq!(new.len(), items.len());

        let moved: Vec<&ExecutionId> = items.iter().filter(|i| old[*i] != new[*i]).collect();
        // Only the newcomer gains items; everything else keeps its owner.
        assert!(moved.iter().all(|i| new[*i].as_str() == "w5"));
        // Expectation is 1000 / 5 = 200.
        assert!(moved.len() < 350, "moved {}", moved.len());
        assert!(!moved.is_empty());
    }

    #[test]
    fn modulo_hash_adding_worker_moves_most_items() {
        let items = items(1000);
        let before = ModuloHash.partition(&items, &workers(4));
        let after = ModuloHash.rebalance(&before, &workers(5));

        let old = owners(&before);
        let new = owners(&after);
        let moved = items.iter().filter(|i| old[*i] != new[*i]).count();
        // Expectation is 800.
        assert!(moved > 600, "moved {moved}");
    }

    #[test]
    fn strategy_for_matches_kind() {
        assert_eq!(
            strategy_for(PartitionStrategyKind::ConsistentHash, 50).name(),
            "consistent_hash"
        );
        assert_eq!(strategy_for(PartitionStrategyKind::Range, 50).name(), "range");
        assert_eq!(strategy_for(PartitionStrategyKind::Hash, 50).name(), "hash");
    }

    #[test]
    fn stable_hash_is_stable() {
        assert_eq!(stable_hash("w1:0"), stable_hash("w1:0"));
        assert_ne!(stable_hash("w1:0"), stable_hash("w1:1"));
    }
}
