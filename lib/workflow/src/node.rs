//! Workflow node types.
//!
//! Nodes are the building blocks of workflows. Each node has:
//! - An ID unique within the workflow
//! - A type tag that decides which structural rules apply to it
//! - A disabled flag (disabled nodes stay in the graph but are skipped)
//! - Opaque parameters handed to the node executor

use flowgrid_core::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The type tag of a workflow node.
///
/// Only the variants with structural meaning are spelled out; any other tag
/// is preserved verbatim as [`NodeType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    /// Entry point fired by a schedule, an event or a manual run.
    Trigger,
    /// Entry point fired by an inbound HTTP call.
    Webhook,
    /// Generic side-effecting step.
    Action,
    /// Branching step; must fan out to at least two targets.
    Condition,
    /// Join step; must be fed by at least two sources.
    Merge,
    /// Any other tag, e.g. `http_request` or `code`.
    Custom(String),
}

impl NodeType {
    /// Returns the wire tag for this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Trigger => "trigger",
            Self::Webhook => "webhook",
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Merge => "merge",
            Self::Custom(tag) => tag,
        }
    }

    /// Returns true for types that may start a workflow without inflow.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger | Self::Webhook)
    }
}

impl From<String> for NodeType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "trigger" => Self::Trigger,
            "webhook" => Self::Webhook,
            "action" => Self::Action,
            "condition" => Self::Condition,
            "merge" => Self::Merge,
            _ => Self::Custom(tag),
        }
    }
}

impl From<&str> for NodeType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<NodeType> for String {
    fn from(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a workflow definition.
///
/// Immutable once a graph has been built from it; editing a workflow means
/// building a fresh graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Identifier, unique within the workflow.
    pub id: NodeId,
    /// Type tag.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Disabled nodes are exempt from reachability and inflow rules.
    #[serde(default)]
    pub disabled: bool,
    /// Executor-specific parameters.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub parameters: JsonValue,
}

impl WorkflowNode {
    /// Creates an enabled node with no parameters.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<NodeType>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            disabled: false,
            parameters: JsonValue::Null,
        }
    }

    /// Shorthand for a trigger node.
    #[must_use]
    pub fn trigger(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeType::Trigger)
    }

    /// Shorthand for an action node.
    #[must_use]
    pub fn action(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeType::Action)
    }

    /// Marks the node disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Sets the executor parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    /// Returns true if this node may start a workflow without inflow.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.node_type.is_trigger()
    }
}
