//! Workflow execution graph built on petgraph.
//!
//! A [`WorkflowGraph`] is a read-only view derived from a workflow's nodes and
//! connections. Building never fails: structural problems (dangling edges,
//! duplicate IDs, cycles) are recorded and surfaced by [`WorkflowGraph::validate`].
//! All queries are pure functions over the immutable structure, so a graph
//! can be shared across threads without locking.
//!
//! Where a traversal has to pick between equally good candidates, the node
//! with the lexically lowest ID wins. This makes topological order and the
//! critical path reproducible.

use crate::edge::Connection;
use crate::error::{DependencyRule, GraphError};
use crate::node::{NodeType, WorkflowNode};
use flowgrid_core::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Dfs, EdgeRef, Reversed, Walker};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// A validated-on-demand execution graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    /// Nodes plus every connection whose endpoints both exist.
    graph: DiGraph<WorkflowNode, Connection>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
    /// Connections referencing a node that is not in the graph.
    dangling: Vec<Connection>,
    /// IDs that appeared more than once; only the first node was kept.
    duplicates: Vec<NodeId>,
    /// Nodes with no inflow, plus every trigger-type node.
    start_nodes: Vec<NodeId>,
    /// Nodes with no outflow.
    end_nodes: Vec<NodeId>,
}

impl WorkflowGraph {
    /// Builds a graph from nodes and connections.
    ///
    /// Nodes keep their input order. A repeated node ID keeps the first node
    /// and records the duplicate; a connection with a missing endpoint is
    /// recorded as dangling instead of being added.
    pub fn build<N, C>(nodes: N, connections: C) -> Self
    where
        N: IntoIterator<Item = WorkflowNode>,
        C: IntoIterator<Item = Connection>,
    {
        let mut graph = DiGraph::new();
        let mut node_index_map = HashMap::new();
        let mut duplicates = Vec::new();

        for node in nodes {
            if node_index_map.contains_key(&node.id) {
                duplicates.push(node.id.clone());
                continue;
            }
            let node_id = node.id.clone();
            let index = graph.add_node(node);
            node_index_map.insert(node_id, index);
        }

        let mut dangling = Vec::new();
        for connection in connections {
            match (
                node_index_map.get(&connection.source_node),
                node_index_map.get(&connection.target_node),
            ) {
                (Some(&source), Some(&target)) => {
                    graph.add_edge(source, target, connection);
                }
                _ => dangling.push(connection),
            }
        }

        let start_nodes = graph
            .node_indices()
            .filter(|&idx| {
                graph[idx].is_trigger()
                    || graph.edges_directed(idx, Direction::Incoming).next().is_none()
            })
            .map(|idx| graph[idx].id.clone())
            .collect();

        let end_nodes = graph
            .node_indices()
            .filter(|&idx| graph.edges_directed(idx, Direction::Outgoing).next().is_none())
            .map(|idx| graph[idx].id.clone())
            .collect();

        Self {
            graph,
            node_index_map,
            dangling,
            duplicates,
            start_nodes,
            end_nodes,
        }
    }

    /// Returns a node by its ID.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&WorkflowNode> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns all nodes in build order.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of resolved edges (dangling connections excluded).
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns nodes with no inflow, plus trigger-type nodes.
    #[must_use]
    pub fn start_nodes(&self) -> &[NodeId] {
        &self.start_nodes
    }

    /// Returns nodes with no outflow.
    #[must_use]
    pub fn end_nodes(&self) -> &[NodeId] {
        &self.end_nodes
    }

    /// Returns connections whose source or target is missing.
    #[must_use]
    pub fn dangling_edges(&self) -> &[Connection] {
        &self.dangling
    }

    /// Returns the targets of a node's outgoing edges, in connection order.
    #[must_use]
    pub fn successors(&self, node_id: &NodeId) -> Vec<&NodeId> {
        self.index(node_id)
            .map(|idx| self.neighbors(idx, Direction::Outgoing))
            .unwrap_or_default()
            .into_iter()
            .map(|idx| &self.graph[idx].id)
            .collect()
    }

    /// Returns the sources of a node's incoming edges, in connection order.
    #[must_use]
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<&NodeId> {
        self.index(node_id)
            .map(|idx| self.neighbors(idx, Direction::Incoming))
            .unwrap_or_default()
            .into_iter()
            .map(|idx| &self.graph[idx].id)
            .collect()
    }

    /// Validates the graph as an execution plan.
    ///
    /// Checks run in a fixed order and the first failure is returned:
    /// 1. cycles (depth-first search with a recursion stack)
    /// 2. dangling connections and duplicate node IDs
    /// 3. non-empty start and end sets
    /// 4. every enabled node reachable from an enabled start node
    /// 5. per-node dependency rules (merge and condition fan, trigger inflow)
    ///
    /// # Errors
    ///
    /// Returns the [`GraphError`] describing the first failed check.
    pub fn validate(&self) -> Result<(), GraphError> {
        if let Some(node_id) = self.find_cycle() {
            return Err(GraphError::CycleDetected {
                node_id: Some(node_id),
            });
        }

        if let Some(connection) = self.dangling.first() {
            return Err(GraphError::DanglingEdge {
                source_node: connection.source_node.clone(),
                target_node: connection.target_node.clone(),
            });
        }
        if let Some(node_id) = self.duplicates.first() {
            return Err(GraphError::DuplicateNode {
                node_id: node_id.clone(),
            });
        }

        if self.start_nodes.is_empty() {
            return Err(GraphError::NoStartNodes);
        }
        if self.end_nodes.is_empty() {
            return Err(GraphError::NoEndNodes);
        }

        let unreachable = self.unreachable_nodes();
        if !unreachable.is_empty() {
            return Err(GraphError::UnreachableNodes {
                node_ids: unreachable,
            });
        }

        self.check_dependency_rules()
    }

    /// Returns every node in dependency order (Kahn's algorithm).
    ///
    /// Among nodes that become ready at the same time, the lowest ID is
    /// emitted first.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if some nodes could not be
    /// ordered, which only happens when the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let order = self.kahn_order();
        if order.len() < self.graph.node_count() {
            return Err(self.cycle_error(&order));
        }
        Ok(order.into_iter().map(|idx| self.graph[idx].id.clone()).collect())
    }

    /// Returns the longest start-to-end path, measured in nodes.
    ///
    /// Distances are relaxed along the topological order. On equal length the
    /// predecessor with the lower ID is kept, and among end nodes at the same
    /// distance the lower ID wins. An empty graph yields an empty path.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph has a cycle.
    pub fn critical_path(&self) -> Result<Vec<NodeId>, GraphError> {
        let order = self.kahn_order();
        if order.len() < self.graph.node_count() {
            return Err(self.cycle_error(&order));
        }

        let mut distance = vec![0usize; self.graph.node_count()];
        let mut predecessor: Vec<Option<NodeIndex>> = vec![None; self.graph.node_count()];
        for node_id in &self.start_nodes {
            if let Some(idx) = self.index(node_id) {
                distance[idx.index()] = 1;
            }
        }

        for &current in &order {
            if distance[current.index()] == 0 {
                continue;
            }
            let candidate = distance[current.index()] + 1;
            for next in self.neighbors(current, Direction::Outgoing) {
                let known = distance[next.index()];
                let wins_tie = candidate == known
                    && predecessor[next.index()]
                        .is_some_and(|p| self.graph[current].id < self.graph[p].id);
                if candidate > known || wins_tie {
                    distance[next.index()] = candidate;
                    predecessor[next.index()] = Some(current);
                }
            }
        }

        let Some(mut cursor) = self
            .end_nodes
            .iter()
            .filter_map(|id| self.index(id))
            .filter(|idx| distance[idx.index()] > 0)
            .max_by(|a, b| {
                distance[a.index()]
                    .cmp(&distance[b.index()])
                    .then_with(|| self.graph[*b].id.cmp(&self.graph[*a].id))
            })
        else {
            return Ok(Vec::new());
        };

        let mut path = vec![self.graph[cursor].id.clone()];
        while let Some(prev) = predecessor[cursor.index()] {
            path.push(self.graph[prev].id.clone());
            cursor = prev;
        }
        path.reverse();
        Ok(path)
    }

    /// Returns every node from which `node_id` can be reached.
    ///
    /// Walks incoming edges without materialising a reversed graph. Unknown
    /// IDs yield an empty set.
    #[must_use]
    pub fn ancestors(&self, node_id: &NodeId) -> BTreeSet<NodeId> {
        let Some(start) = self.index(node_id) else {
            return BTreeSet::new();
        };
        Dfs::new(Reversed(&self.graph), start)
            .iter(Reversed(&self.graph))
            .filter(|&idx| idx != start)
            .map(|idx| self.graph[idx].id.clone())
            .collect()
    }

    /// Returns every node reachable from `node_id`.
    #[must_use]
    pub fn descendants(&self, node_id: &NodeId) -> BTreeSet<NodeId> {
        let Some(start) = self.index(node_id) else {
            return BTreeSet::new();
        };
        Dfs::new(&self.graph, start)
            .iter(&self.graph)
            .filter(|&idx| idx != start)
            .map(|idx| self.graph[idx].id.clone())
            .collect()
    }

    /// Returns true if `target` is reachable from `source`.
    ///
    /// A node is always connected to itself.
    #[must_use]
    pub fn is_connected(&self, source: &NodeId, target: &NodeId) -> bool {
        if source == target {
            return true;
        }
        let (Some(from), Some(to)) = (self.index(source), self.index(target)) else {
            return false;
        };
        let mut bfs = Bfs::new(&self.graph, from);
        while let Some(idx) = bfs.next(&self.graph) {
            if idx == to {
                return true;
            }
        }
        false
    }

    /// Returns enabled nodes that are ready to run given the completed set.
    ///
    /// A node is fireable when it has not completed yet and every
    /// predecessor is satisfied. A predecessor is satisfied when it has
    /// completed, or when it is disabled and its own predecessors are
    /// satisfied (disabled nodes pass their inflow straight through).
    #[must_use]
    pub fn fireable_nodes(&self, completed: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut memo = HashMap::new();
        self.graph
            .node_indices()
            .filter(|&idx| {
                let node = &self.graph[idx];
                !node.disabled && !completed.contains(&node.id)
            })
            .filter(|&idx| {
                self.neighbors(idx, Direction::Incoming)
                    .into_iter()
                    .all(|pred| self.is_satisfied(pred, completed, &mut memo))
            })
            .map(|idx| self.graph[idx].id.clone())
            .collect()
    }

    fn is_satisfied(
        &self,
        idx: NodeIndex,
        completed: &HashSet<NodeId>,
        memo: &mut HashMap<NodeIndex, bool>,
    ) -> bool {
        if let Some(&known) = memo.get(&idx) {
            return known;
        }
        let node = &self.graph[idx];
        if completed.contains(&node.id) {
            memo.insert(idx, true);
            return true;
        }
        if !node.disabled {
            memo.insert(idx, false);
            return false;
        }
        // Guards against revisiting through a cycle.
        memo.insert(idx, false);
        let satisfied = self
            .neighbors(idx, Direction::Incoming)
            .into_iter()
            .all(|pred| self.is_satisfied(pred, completed, memo));
        memo.insert(idx, satisfied);
        satisfied
    }

    fn index(&self, node_id: &NodeId) -> Option<NodeIndex> {
        self.node_index_map.get(node_id).copied()
    }

    /// Neighbors along `direction`, ordered by connection insertion.
    fn neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut edges: Vec<_> = self.graph.edges_directed(idx, direction).collect();
        edges.sort_by_key(|edge| edge.id());
        edges
            .into_iter()
            .map(|edge| match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            })
            .collect()
    }

    /// Depth-first search with an explicit recursion stack.
    ///
    /// Returns the node that closed the first cycle found, visiting roots in
    /// build order.
    fn find_cycle(&self) -> Option<NodeId> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        struct Frame {
            node: NodeIndex,
            children: Vec<NodeIndex>,
            next: usize,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            marks[root.index()] = Mark::OnStack;
            let mut stack = vec![Frame {
                node: root,
                children: self.neighbors(root, Direction::Outgoing),
                next: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                let child = frame.children.get(frame.next).copied();
                frame.next += 1;
                match child {
                    Some(child) => match marks[child.index()] {
                        Mark::OnStack => return Some(self.graph[child].id.clone()),
                        Mark::Unvisited => {
                            marks[child.index()] = Mark::OnStack;
                            stack.push(Frame {
                                node: child,
                                children: self.neighbors(child, Direction::Outgoing),
                                next: 0,
                            });
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[frame.node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    /// Kahn's algorithm; emits fewer than `node_count` nodes on a cycle.
    fn kahn_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.edges_directed(idx, Direction::Incoming).count())
            .collect();

        let mut ready: BTreeSet<(&NodeId, NodeIndex)> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .map(|idx| (&self.graph[idx].id, idx))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some((_, current)) = ready.pop_first() {
            order.push(current);
            for next in self.neighbors(current, Direction::Outgoing) {
                let degree = &mut in_degree[next.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((&self.graph[next].id, next));
                }
            }
        }
        order
    }

    /// Builds the cycle error for a partial Kahn order.
    fn cycle_error(&self, order: &[NodeIndex]) -> GraphError {
        let emitted: HashSet<NodeIndex> = order.iter().copied().collect();
        let node_id = self
            .graph
            .node_indices()
            .filter(|idx| !emitted.contains(idx))
            .map(|idx| &self.graph[idx].id)
            .min()
            .cloned();
        GraphError::CycleDetected { node_id }
    }

    /// Breadth-first walk from the enabled start nodes.
    fn unreachable_nodes(&self) -> Vec<NodeId> {
        let mut visited = vec![false; self.graph.node_count()];
        let mut queue: VecDeque<NodeIndex> = self
            .start_nodes
            .iter()
            .filter_map(|id| self.index(id))
            .filter(|&idx| !self.graph[idx].disabled)
            .collect();
        for idx in &queue {
            visited[idx.index()] = true;
        }

        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if !visited[next.index()] {
                    visited[next.index()] = true;
                    queue.push_back(next);
                }
            }
        }

        self.graph
            .node_indices()
            .filter(|idx| !visited[idx.index()] && !self.graph[*idx].disabled)
            .map(|idx| self.graph[idx].id.clone())
            .collect()
    }

    fn check_dependency_rules(&self) -> Result<(), GraphError> {
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            if node.disabled {
                continue;
            }
            let incoming = self.graph.edges_directed(idx, Direction::Incoming).count();
            let outgoing = self.graph.edges_directed(idx, Direction::Outgoing).count();

            let violated = match node.node_type {
                NodeType::Merge if incoming < 2 => Some(DependencyRule::MergeNeedsTwoInputs),
                NodeType::Condition if outgoing < 2 => {
                    Some(DependencyRule::ConditionNeedsTwoOutputs)
                }
                _ if !node.is_trigger() && incoming == 0 => Some(DependencyRule::MissingInflow),
                _ => None,
            };

            if let Some(rule) = violated {
                return Err(GraphError::DependencyRuleViolation {
                    node_id: node.id.clone(),
                    rule,
                });
            }
        }
        Ok(())
    }
}
