//! Units of work handed to workers.

use crate::selection::WorkRequirements;
use flowgrid_core::{ExecutionId, NodeId, WorkflowRunId};
use flowgrid_workflow::{ActiveWorkflow, NodeType, WorkflowError, WorkflowNode};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One node of one workflow run, ready to be placed on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// `"{run_id}:{node_id}"`; the key of the partition map.
    pub execution_id: ExecutionId,
    pub run_id: WorkflowRunId,
    pub node_id: NodeId,
    pub node_type: NodeType,
    #[serde(default)]
    pub requirements: WorkRequirements,
}

impl UnitOfWork {
    /// Builds the unit for `node` within `run_id`.
    #[must_use]
    pub fn for_node(
        run_id: WorkflowRunId,
        node: &WorkflowNode,
        requirements: WorkRequirements,
    ) -> Self {
        Self {
            execution_id: Self::execution_id_for(run_id, &node.id),
            run_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            requirements,
        }
    }

    #[must_use]
    pub fn execution_id_for(run_id: WorkflowRunId, node_id: &NodeId) -> ExecutionId {
        ExecutionId::new(format!("{run_id}:{node_id}"))
    }
}

/// Produces the units that may run next for a run of `workflow`.
///
/// Every unit gets a copy of `requirements`.
///
/// # Errors
///
/// Propagates ordering failures from [`ActiveWorkflow::next_nodes`].
pub fn next_units(
    workflow: &ActiveWorkflow,
    run_id: WorkflowRunId,
    completed: &HashSet<NodeId>,
    requirements: &WorkRequirements,
) -> Result<Vec<UnitOfWork>, Report<WorkflowError>> {
    Ok(workflow
        .next_nodes(completed)?
        .into_iter()
        .map(|node| UnitOfWork::for_node(run_id, node, requirements.clone()))
        .collect())
}
