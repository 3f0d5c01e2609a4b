//! Core domain types and utilities for the flowgrid execution platform.
//!
//! This crate provides the identifiers and error handling shared by the
//! workflow graph engine and the work-coordination layer.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ExecutionId, NodeId, ParseIdError, PartitionId, WorkerId, WorkflowId, WorkflowRunId};
