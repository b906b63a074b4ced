//! Visualization projection - the runtime's read model for UIs.
//!
//! Rendering (diagrams, CLIs, web views) is the caller's business; the
//! runtime only provides an aggregated, serializable projection of one
//! state: where every path is, how often each node has run, and which
//! transitions are currently on offer at agent decision points.

use crate::error::Result;
use crate::evaluator;
use crate::state::{ExecutionState, PathStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One path's position and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathView {
    /// Path id
    pub id: String,
    /// Node the path sits at
    pub current_node: String,
    /// Lifecycle status
    pub status: PathStatus,
    /// Units of work consumed
    pub step_count: u64,
    /// Failure reason, when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// A transition currently offered to the agent on some path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferedTransition {
    /// Path the offer belongs to
    pub path_id: String,
    /// Target node
    pub target: String,
}

/// The aggregated projection of one execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationState {
    /// Driver ticks so far
    pub step_count: u64,

    /// Every path, in creation order
    pub paths: Vec<PathView>,

    /// Visit counts aggregated across paths
    pub node_visits: BTreeMap<String, u32>,

    /// Transitions currently on offer at active agent decision points
    pub offered_transitions: Vec<OfferedTransition>,

    /// Paths downgraded to failed so far
    pub error_count: u64,
}

/// Project a state into its visualization read model.
pub fn project(state: &ExecutionState) -> Result<VisualizationState> {
    let mut node_visits: BTreeMap<String, u32> = BTreeMap::new();
    let mut paths = Vec::new();
    let mut offered_transitions = Vec::new();

    for path in &state.paths {
        for (node, count) in &path.node_visits {
            *node_visits.entry(node.clone()).or_insert(0) += count;
        }
        paths.push(PathView {
            id: path.id.clone(),
            current_node: path.current_node.clone(),
            status: path.status,
            step_count: path.step_count,
            failure: path.failure.clone(),
        });

        let at_decision_point = path.status == PathStatus::Active
            && state
                .snapshot
                .node(&path.current_node)
                .map(|n| n.requires_agent())
                .unwrap_or(false);
        if at_decision_point {
            for target in evaluator::eligible_agent_transitions(state, path)? {
                offered_transitions.push(OfferedTransition {
                    path_id: path.id.clone(),
                    target,
                });
            }
        }
    }

    Ok(VisualizationState {
        step_count: state.metadata.step_count,
        paths,
        node_visits,
        offered_transitions,
        error_count: state.metadata.error_count,
    })
}
