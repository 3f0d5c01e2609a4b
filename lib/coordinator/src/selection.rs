//! Worker selection strategies.
//!
//! Selection runs over a candidate list that the coordinator has already
//! filtered (Active, under capacity, carrying the required tags) and sorted by
//! worker ID, so every strategy except `Random` is deterministic.

use crate::worker::WorkerNode;
use flowgrid_core::ExecutionId;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a worker is picked from the eligible candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest `load / capacity`; ties go to the lowest worker ID.
    #[default]
    LeastLoaded,
    /// Cycles through candidates using the distributed-work counter.
    RoundRobin,
    /// Uniform random choice.
    Random,
    /// Same affinity key, same worker, while the candidate list is unchanged.
    Affinity,
}

/// Constraints and routing preferences for one unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequirements {
    /// Capability tags the worker must carry.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Routing key for [`SelectionStrategy::Affinity`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_key: Option<String>,
}

impl WorkRequirements {
    /// Requirements with only a strategy.
    #[must_use]
    pub fn with_strategy(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Affinity routing on `key`.
    #[must_use]
    pub fn affinity(key: impl Into<String>) -> Self {
        Self {
            strategy: SelectionStrategy::Affinity,
            affinity_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Adds required tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Key hashed by affinity routing: the explicit key, else the execution ID.
    #[must_use]
    pub fn routing_key<'a>(&'a self, execution_id: &'a ExecutionId) -> &'a str {
        self.affinity_key
            .as_deref()
            .unwrap_or_else(|| execution_id.as_str())
    }
}

/// Polynomial string hash: `hash = hash * 31 + code_unit`, wrapping.
#[must_use]
pub fn affinity_hash(key: &str) -> u32 {
    key.encode_utf16()
        .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(u32::from(unit)))
}

/// Picks one of `candidates`.
///
/// `counter` is the coordinator's distributed-work counter (used by
/// round-robin) and `affinity_key` the key hashed by affinity routing.
/// Returns `None` only when there are no candidates.
#[must_use]
pub fn select<'a>(
    candidates: &[&'a WorkerNode],
    strategy: SelectionStrategy,
    counter: u64,
    affinity_key: &str,
) -> Option<&'a WorkerNode> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        SelectionStrategy::LeastLoaded => candidates
            .iter()
            .copied()
            .min_by(|a, b| a.cmp_load(b).then_with(|| a.id.cmp(&b.id))),
        SelectionStrategy::RoundRobin => {
            let index = (counter % candidates.len() as u64) as usize;
            Some(candidates[index])
        }
        SelectionStrategy::Random => candidates.choose(&mut rand::rng()).copied(),
        SelectionStrategy::Affinity => {
            let index = affinity_hash(affinity_key) as usize % candidates.len();
            Some(candidates[index])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> Vec<WorkerNode> {
        vec![
            WorkerNode::new("w1", "a", 2).with_load(2),
            WorkerNode::new("w2", "b", 2),
            WorkerNode::new("w3", "c", 4).with_load(1),
        ]
    }

    #[test]
    fn least_loaded_picks_lowest_ratio() {
        let workers = fleet();
        let candidates: Vec<&WorkerNode> = workers.iter().collect();
        let chosen = select(&candidates, SelectionStrategy::LeastLoaded, 0, "").expect("chosen");
        assert_eq!(chosen.id.as_str(), "w2");
    }

    #[test]
    fn least_loaded_ties_go_to_lowest_id() {
        let workers = vec![
            WorkerNode::new("b", "b", 4).with_load(2),
            WorkerNode::new("a", "a", 2).with_load(1),
        ];
        let candidates: Vec<&WorkerNode> = workers.iter().collect();
        let chosen = select(&candidates, SelectionStrategy::LeastLoaded, 0, "").expect("chosen");
        assert_eq!(chosen.id.as_str(), "a");
    }

    #[test]
    fn round_robin_follows_counter() {
        let workers = fleet();
        let candidates: Vec<&WorkerNode> = workers.iter().collect();
        let picks: Vec<&str> = (0..4)
            .filter_map(|n| select(&candidates, SelectionStrategy::RoundRobin, n, ""))
            .map(|w| w.id.as_str())
            .collect();
        assert_eq!(picks, vec!["w1", "w2", "w3", "w1"]);
    }

    #[test]
    fn random_picks_a_candidate() {
        let workers = fleet();
        let candidates: Vec<&WorkerNode> = workers.iter().collect();
        for _ in 0..20 {
            let chosen = select(&candidates, SelectionStrategy::Random, 0, "").expect("chosen");
            assert!(workers.iter().any(|w| w.id == chosen.id));
        }
    }

    #[test]
    fn affinity_is_stable_for_same_key() {
        let workers = fleet();
        let candidates: Vec<&WorkerNode> = workers.iter().collect();
        let first = select(&candidates, SelectionStrategy::Affinity, 0, "customer-42");
        for counter in 1..10 {
            let again = select(&candidates, SelectionStrategy::Affinity, counter, "customer-42");
            assert_eq!(first.map(|w| &w.id), again.map(|w| &w.id));
        }
    }

    #[test]
    fn affinity_hash_matches_polynomial() {
        assert_eq!(affinity_hash(""), 0);
        assert_eq!(affinity_hash("a"), 97);
        assert_eq!(affinity_hash("ab"), 97 * 31 + 98);
    }

    #[test]
    fn routing_key_falls_back_to_execution_id() {
        let execution_id = ExecutionId::from("run-1:charge");
        assert_eq!(
            WorkRequirements::default().routing_key(&execution_id),
            "run-1:charge"
        );
        assert_eq!(
            WorkRequirements::affinity("customer-7").routing_key(&execution_id),
            "customer-7"
        );
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(select(&[], SelectionStrategy::LeastLoaded, 0, "").is_none());
    }

    #[test]
    fn requirements_deserialize_with_defaults() {
        let req: WorkRequirements = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(req.strategy, SelectionStrategy::LeastLoaded);
        assert!(req.tags.is_empty());
        assert!(req.affinity_key.is_none());
    }
}
