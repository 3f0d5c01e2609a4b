//! Node executor contract.
//!
//! A worker that has been assigned a unit of work hands the node to a
//! [`NodeExecutor`]. How a node talks to HTTP services, databases or a code
//! sandbox is up to the executor; the coordination layer only observes
//! whether the call completed or failed.

use crate::node::{NodeType, WorkflowNode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Runs the business logic of a node.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Executes a node with the given input payload.
    ///
    /// Returns the output payload as JSON.
    async fn execute(
        &self,
        node: &WorkflowNode,
        input: JsonValue,
    ) -> Result<JsonValue, NodeExecutionError>;
}

/// Errors from node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeExecutionError {
    /// Input validation failed.
    InvalidInput { message: String },
    /// Execution failed.
    ExecutionFailed { message: String },
    /// No executor is registered for the node type.
    UnsupportedNodeType { node_type: String },
    /// Timeout.
    Timeout,
}

impl std::fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::UnsupportedNodeType { node_type } => {
                write!(f, "unsupported node type: {node_type}")
            }
            Self::Timeout => write!(f, "execution timed out"),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

/// Dispatches nodes to executors keyed by node type tag.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the executor for a node type, replacing any previous one.
    #[must_use]
    pub fn with(mut self, node_type: impl Into<NodeType>, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.insert(node_type.into(), executor);
        self
    }

    /// Returns true if some executor handles the node type.
    #[must_use]
    pub fn supports(&self, node_type: &NodeType) -> bool {
        self.executors.contains_key(node_type)
    }
}

#[async_trait]
impl NodeExecutor for ExecutorRegistry {
    async fn execute(
        &self,
        node: &WorkflowNode,
        input: JsonValue,
    ) -> Result<JsonValue, NodeExecutionError> {
        let executor = self.executors.get(&node.node_type).ok_or_else(|| {
            NodeExecutionError::UnsupportedNodeType {
                node_type: node.node_type.to_string(),
            }
        })?;
        executor.execute(node, input).await
    }
}

/// Passes the input through unchanged.
///
/// Useful for trigger and merge nodes, whose only job is to forward data.
pub struct PassThroughExecutor;

#[async_trait]
impl NodeExecutor for PassThroughExecutor {
    async fn execute(
        &self,
        _node: &WorkflowNode,
        input: JsonValue,
    ) -> Result<JsonValue, NodeExecutionError> {
        Ok(input)
    }
}
