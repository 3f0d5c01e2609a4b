//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: structural problems found while validating a graph
//! - `WorkflowError`: definition-level operations (wraps `GraphError` via context)

use flowgrid_core::{NodeId, WorkflowId};
use std::fmt;

/// A per-node dependency rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyRule {
    /// A merge node needs at least two incoming edges.
    MergeNeedsTwoInputs,
    /// A condition node needs at least two outgoing edges.
    ConditionNeedsTwoOutputs,
    /// A non-trigger node needs at least one incoming edge.
    MissingInflow,
}

impl fmt::Display for DependencyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MergeNeedsTwoInputs => write!(f, "merge node requires at least 2 incoming edges"),
            Self::ConditionNeedsTwoOutputs => {
                write!(f, "condition node requires at least 2 outgoing edges")
            }
            Self::MissingInflow => write!(f, "non-trigger node has no incoming edge"),
        }
    }
}

/// Errors from graph validation and ordering.
///
/// These errors contain only information available at the graph layer.
/// Workflow-level context (like workflow_id) should be added by the caller
/// using `.context()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Graph contains a cycle; `node_id` is where it was first closed, if known.
    CycleDetected { node_id: Option<NodeId> },
    /// A connection references a node that is not part of the graph.
    DanglingEdge {
        source_node: NodeId,
        target_node: NodeId,
    },
    /// Two nodes share the same ID.
    DuplicateNode { node_id: NodeId },
    /// No node qualifies as a start node.
    NoStartNodes,
    /// No node qualifies as an end node.
    NoEndNodes,
    /// Enabled nodes that cannot be reached from any start node.
    UnreachableNodes { node_ids: Vec<NodeId> },
    /// A node breaks a per-type dependency rule.
    DependencyRuleViolation { node_id: NodeId, rule: DependencyRule },
}

impl GraphError {
    /// Returns true for the cycle error, false for every other structural error.
    #[must_use]
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CycleDetected { .. })
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleDetected { node_id: Some(node_id) } => {
                write!(f, "workflow has a cycle through node {node_id}")
            }
            Self::CycleDetected { node_id: None } => write!(f, "workflow has a cycle"),
            Self::DanglingEdge {
                source_node,
                target_node,
            } => write!(
                f,
                "connection {source_node} -> {target_node} references a missing node"
            ),
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::NoStartNodes => write!(f, "workflow has no start node"),
            Self::NoEndNodes => write!(f, "workflow has no end node"),
            Self::UnreachableNodes { node_ids } => {
                let ids: Vec<&str> = node_ids.iter().map(NodeId::as_str).collect();
                write!(f, "unreachable nodes: {}", ids.join(", "))
            }
            Self::DependencyRuleViolation { node_id, rule } => {
                write!(f, "node {node_id}: {rule}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// High-level workflow errors.
///
/// Use these to add workflow context when wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Activation refused because the graph failed validation.
    ActivationRejected { workflow_id: WorkflowId },
    /// Run-time graph query failed (use as context wrapper).
    GraphOperation { workflow_id: WorkflowId },
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActivationRejected { workflow_id } => {
                write!(f, "activation rejected for workflow {workflow_id}")
            }
            Self::GraphOperation { workflow_id } => {
                write!(f, "graph operation failed for workflow {workflow_id}")
            }
        }
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_display_names_node() {
        let err = GraphError::CycleDetected {
            node_id: Some(NodeId::from("b")),
        };
        assert_eq!(err.to_string(), "workflow has a cycle through node b");
        assert!(err.is_cycle());
    }

    #[test]
    fn dependency_violation_display() {
        let err = GraphError::DependencyRuleViolation {
            node_id: NodeId::from("join"),
            rule: DependencyRule::MergeNeedsTwoInputs,
        };
        assert!(err.to_string().contains("join"));
        assert!(err.to_string().contains("at least 2 incoming"));
        assert!(!err.is_cycle());
    }

    #[test]
    fn unreachable_lists_nodes() {
        let err = GraphError::UnreachableNodes {
            node_ids: vec![NodeId::from("x"), NodeId::from("y")],
        };
        assert_eq!(err.to_string(), "unreachable nodes: x, y");
    }

    #[test]
    fn workflow_error_display() {
        let workflow_id = WorkflowId::new();
        let err = WorkflowError::ActivationRejected { workflow_id };
        assert!(err.to_string().contains("activation rejected"));
    }
}
