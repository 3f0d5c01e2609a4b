//! Workflow definition types.
//!
//! A workflow definition is the authoring-side snapshot: metadata plus the
//! node and connection lists. Activation builds the execution graph from the
//! snapshot and refuses to proceed unless it validates.

use crate::edge::Connection;
use crate::error::WorkflowError;
use crate::graph::WorkflowGraph;
use crate::node::WorkflowNode;
use chrono::{DateTime, Utc};
use flowgrid_core::{NodeId, WorkflowId};
use rootcause::prelude::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// A complete workflow definition as produced by the authoring service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Nodes in authoring order.
    pub nodes: Vec<WorkflowNode>,
    /// Directed connections between nodes.
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// When this definition was last changed.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates an empty definition with a fresh ID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Appends a node.
    #[must_use]
    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends a connection between the default ports.
    #[must_use]
    pub fn with_connection(
        mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Self {
        self.connections.push(Connection::between(source, target));
        self
    }

    /// Builds the (possibly invalid) execution graph for this snapshot.
    #[must_use]
    pub fn graph(&self) -> WorkflowGraph {
        WorkflowGraph::build(self.nodes.iter().cloned(), self.connections.iter().cloned())
    }

    /// Builds and validates the graph, producing an activated workflow.
    ///
    /// # Errors
    ///
    /// Returns the validation failure wrapped in
    /// [`WorkflowError::ActivationRejected`].
    pub fn activate(self) -> Result<ActiveWorkflow, Report<WorkflowError>> {
        let graph = self.graph();
        let workflow_id = self.id;

        graph
            .validate()
            .inspect_err(|e| warn!(workflow_id = %workflow_id, error = %e, "workflow rejected"))
            .context(WorkflowError::ActivationRejected { workflow_id })?;

        debug!(
            workflow_id = %workflow_id,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "workflow activated"
        );

        Ok(ActiveWorkflow {
            definition: self,
            graph,
        })
    }
}

/// A validated workflow snapshot together with the graph built from it.
///
/// The graph lives exactly as long as the snapshot; a changed definition has
/// to be activated again.
#[derive(Debug, Clone)]
pub struct ActiveWorkflow {
    definition: WorkflowDefinition,
    graph: WorkflowGraph,
}

impl ActiveWorkflow {
    /// Returns the workflow ID.
    #[must_use]
    pub fn id(&self) -> WorkflowId {
        self.definition.id
    }

    /// Returns the definition snapshot.
    #[must_use]
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Returns the validated graph.
    #[must_use]
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Returns the nodes that may run next, in dependency order.
    ///
    /// # Errors
    ///
    /// Cannot fail for an activated workflow; the cycle check is repeated
    /// only because ordering is computed on demand.
    pub fn next_nodes(
        &self,
        completed: &HashSet<NodeId>,
    ) -> Result<Vec<&WorkflowNode>, Report<WorkflowError>> {
        let fireable: HashSet<NodeId> = self.graph.fireable_nodes(completed).into_iter().collect();
        let order = self
            .graph
            .topological_order()
            .context(WorkflowError::GraphOperation {
                workflow_id: self.id(),
            })?;

        Ok(order
            .iter()
            .filter(|id| fireable.contains(*id))
            .filter_map(|id| self.graph.node(id))
            .collect())
    }

    /// Releases the snapshot, dropping the graph.
    #[must_use]
    pub fn into_definition(self) -> WorkflowDefinition {
        self.definition
    }
}

impl From<ActiveWorkflow> for WorkflowDefinition {
    fn from(active: ActiveWorkflow) -> Self {
        active.into_definition()
    }
}

/// Returns true if the report came from a structural graph failure.
#[must_use]
pub fn is_structural_rejection(report: &Report<WorkflowError>) -> bool {
    matches!(
        report.current_context(),
        WorkflowError::ActivationRejected { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeType;

    fn order_pipeline() -> WorkflowDefinition {
        WorkflowDefinition::new("order pipeline")
            .with_node(WorkflowNode::new("hook", NodeType::Webhook))
            .with_node(WorkflowNode::action("charge"))
            .with_node(WorkflowNode::action("reserve"))
            .with_node(WorkflowNode::new("join", NodeType::Merge))
            .with_connection("hook", "charge")
            .with_connection("hook", "reserve")
            .with_connection("charge", "join")
            .with_connection("reserve", "join")
    }

    #[test]
    fn activation_accepts_valid_definition() {
        let definition = order_pipeline();
        let id = definition.id;
        let active = definition.activate().expect("valid");
        assert_eq!(active.id(), id);
        assert_eq!(active.graph().node_count(), 4);
    }

    #[test]
    fn activation_rejects_cycle() {
        let definition = order_pipeline().with_connection("join", "charge");
        let report = definition.activate().unwrap_err();
        assert!(is_structural_rejection(&report));
        assert!(report.to_string().contains("activation rejected"));
    }

    #[test]
    fn next_nodes_in_dependency_order() {
        let active = order_pipeline().activate().expect("valid");
        let mut completed = HashSet::new();

        let first: Vec<&str> = active
            .next_nodes(&completed)
            .expect("acyclic")
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(first, vec!["hook"]);

        completed.insert(NodeId::from("hook"));
        let second: Vec<&str> = active
            .next_nodes(&completed)
            .expect("acyclic")
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(second, vec!["charge", "reserve"]);
    }

    #[test]
    fn definition_json_roundtrip_preserves_graph_inputs() {
        let definition = order_pipeline();
        let json = serde_json::to_string(&definition).expect("serialize");
        let parsed: WorkflowDefinition = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, definition);
        assert_eq!(parsed.graph().edge_count(), 4);
    }
}
