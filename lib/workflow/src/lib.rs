//! Workflow execution-graph engine for flowgrid.
//!
//! This crate provides:
//!
//! - **Definitions**: the node and connection lists produced by the authoring side
//! - **Graph**: a petgraph-backed DAG with validation, topological ordering,
//!   critical-path and reachability queries
//! - **Executor contract**: the trait a worker calls to run a node's business logic

pub mod definition;
pub mod edge;
pub mod error;
pub mod executor;
pub mod graph;
pub mod node;

pub use definition::{ActiveWorkflow, WorkflowDefinition};
pub use edge::Connection;
pub use error::{DependencyRule, GraphError, WorkflowError};
pub use executor::{ExecutorRegistry, NodeExecutionError, NodeExecutor, PassThroughExecutor};
pub use graph::WorkflowGraph;
pub use node::{NodeType, WorkflowNode};
