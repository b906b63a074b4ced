//! Transition evaluation - what happens next for one path.
//!
//! Given the current node of an active path, [`evaluate_transition`] decides
//! whether the path completes, transitions automatically, needs an agent
//! decision, parks at a barrier, forks, fans out over data, or hands work to
//! detached paths. The evaluator is pure: it inspects state and returns a
//! [`TransitionDecision`]; the driver applies it.
//!
//! Decision order, first match wins:
//!
//! 1. No outbound transition-capable edge → the path **completes**.
//!    Data/dependency edges are filtered out up front - they declare
//!    read/write permission, never control flow.
//! 2. `@parallel` edges with satisfied conditions fork the path. Static
//!    fan-out happens at evaluation time, independent of agent choice.
//! 3. **Agent-before-transition invariant**: a node carrying a prompt must
//!    see at least one agent round on this visit before any transition
//!    fires - even a trivially-true condition waits. This check
//!    deliberately precedes condition short-circuiting.
//! 4. `@auto` edges, and edges whose condition evaluates true, fire an
//!    automatic transition (the agent requirement is satisfied by now).
//! 5. A satisfied `@barrier(name[, group])` edge parks the path as waiting.
//! 6. A satisfied `@map(source[, group])` edge resolves its array and fans
//!    out one path per element; a non-array source is a structural error,
//!    an empty array spawns zero paths and is not an error.
//! 7. Satisfied `@async` edges auto-spawn **only** on nodes that require no
//!    agent decision; on prompted nodes they are offered to the agent as
//!    `spawn_async_to_*` tools instead and never auto-fire.
//! 8. Otherwise the path is stalled this tick: prompted nodes go back to
//!    the agent for another round, unprompted nodes wait for sibling paths
//!    to change the context (bounded by the per-path step budget).

use crate::context;
use crate::error::{FlowError, Result};
use crate::expr;
use crate::graph::Edge;
use crate::state::{ExecutionState, Path};
use serde_json::Value;

/// The evaluator's verdict for one path, one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionDecision {
    /// No outbound transition-capable edges; the path is done.
    Complete,

    /// Move to `target` without consulting the agent.
    Automatic {
        /// Node to enter
        target: String,
    },

    /// The node requires an agent round before anything else can happen.
    AgentDecision,

    /// Park at barrier `name`; continue at `target` once released.
    BarrierArrive {
        /// Barrier name
        name: String,
        /// Group this arrival counts for, when declared on the edge
        group: Option<String>,
        /// Node the path continues at after release
        target: String,
    },

    /// Fork into one new path per target; the original path completes.
    ParallelFork {
        /// Fork targets, in edge-definition order
        targets: Vec<String>,
    },

    /// Spawn one path per resolved array element; the original completes.
    MapFanOut {
        /// The qualified field the array came from
        source: String,
        /// Group id for the spawned paths
        group: Option<String>,
        /// Node each spawned path starts at
        target: String,
        /// The resolved elements
        items: Vec<Value>,
    },

    /// Auto-spawn detached paths at the targets; the original completes.
    AsyncSpawn {
        /// Spawn targets, in edge-definition order
        targets: Vec<String>,
    },

    /// Nothing can fire this tick.
    Stalled,
}

fn condition_holds(edge: &Edge, scope: &Value) -> Result<bool> {
    match &edge.condition {
        Some(cond) => expr::eval_condition(cond, scope),
        None => Ok(true),
    }
}

/// Evaluate the next move for `path`. See the module docs for the decision
/// order.
pub fn evaluate_transition(state: &ExecutionState, path: &Path) -> Result<TransitionDecision> {
    let snapshot = &state.snapshot;
    let node = snapshot.node(&path.current_node).ok_or_else(|| {
        FlowError::structural(format!(
            "path '{}' sits at unknown node '{}'",
            path.id, path.current_node
        ))
    })?;

    // Data/dependency edges never transition.
    let edges: Vec<&Edge> = snapshot
        .outgoing(&node.name)
        .into_iter()
        .filter(|e| e.semantic_kind().can_transition())
        .collect();
    if edges.is_empty() {
        return Ok(TransitionDecision::Complete);
    }

    let scope = context::evaluation_scope(state, Some(path));

    // Static fan-out fires regardless of any pending agent decision.
    let mut parallel_targets = Vec::new();
    for edge in edges.iter().filter(|e| e.is_parallel()) {
        if condition_holds(edge, &scope)? {
            parallel_targets.push(edge.target.clone());
        }
    }
    if !parallel_targets.is_empty() {
        return Ok(TransitionDecision::ParallelFork {
            targets: parallel_targets,
        });
    }

    // The agent must be consulted before any condition is allowed to
    // short-circuit a prompted node.
    if node.requires_agent() && path.agent_rounds == 0 {
        return Ok(TransitionDecision::AgentDecision);
    }

    for edge in &edges {
        if !edge.is_plain() {
            continue;
        }
        // Automatic: `@auto` (still gated by its condition, if any) or a
        // condition that holds. A plain unconditioned edge is the agent's
        // to take, never automatic.
        if (edge.is_auto() || edge.condition.is_some()) && condition_holds(edge, &scope)? {
            return Ok(TransitionDecision::Automatic {
                target: edge.target.clone(),
            });
        }
    }

    for edge in &edges {
        let Some((name, group)) = edge.barrier() else {
            continue;
        };
        if condition_holds(edge, &scope)? {
            return Ok(TransitionDecision::BarrierArrive {
                name: name.to_string(),
                group: group.map(str::to_string),
                target: edge.target.clone(),
            });
        }
    }

    for edge in &edges {
        let Some((source, group)) = edge.map_spec() else {
            continue;
        };
        if !condition_holds(edge, &scope)? {
            continue;
        }
        let resolved = expr::lookup_path(&scope, source);
        let items = match resolved {
            Value::Array(items) => items,
            Value::Null => {
                return Err(FlowError::structural(format!(
                    "@map source '{}' is undefined",
                    source
                )))
            }
            other => {
                return Err(FlowError::structural(format!(
                    "@map source '{}' is not an array (got {})",
                    source,
                    type_name(&other)
                )))
            }
        };
        return Ok(TransitionDecision::MapFanOut {
            source: source.to_string(),
            group: group.map(str::to_string),
            target: edge.target.clone(),
            items,
        });
    }

    // Async edges auto-fire only when no agent decision guards the node; on
    // prompted nodes they surface as spawn tools instead.
    if !node.requires_agent() {
        let mut async_targets = Vec::new();
        for edge in edges.iter().filter(|e| e.is_async()) {
            if condition_holds(edge, &scope)? {
                async_targets.push(edge.target.clone());
            }
        }
        if !async_targets.is_empty() {
            return Ok(TransitionDecision::AsyncSpawn {
                targets: async_targets,
            });
        }
    }

    if node.requires_agent() {
        // The agent ran but no transition fired; give it another round.
        return Ok(TransitionDecision::AgentDecision);
    }

    Ok(TransitionDecision::Stalled)
}

/// Transition targets the agent may pick from: plain control/transform
/// edges, not `@auto`, whose condition currently holds. These become
/// `transition_to_*` tools.
pub fn eligible_agent_transitions(state: &ExecutionState, path: &Path) -> Result<Vec<String>> {
    let scope = context::evaluation_scope(state, Some(path));
    let mut targets = Vec::new();
    for edge in state.snapshot.outgoing(&path.current_node) {
        if !edge.semantic_kind().can_transition() || !edge.is_plain() || edge.is_auto() {
            continue;
        }
        if condition_holds(edge, &scope)? {
            targets.push(edge.target.clone());
        }
    }
    Ok(targets)
}

/// `@async` targets the agent may spawn: satisfied async edges on the
/// current node. These become `spawn_async_to_*` tools.
pub fn agent_async_targets(state: &ExecutionState, path: &Path) -> Result<Vec<String>> {
    let scope = context::evaluation_scope(state, Some(path));
    let mut targets = Vec::new();
    for edge in state.snapshot.outgoing(&path.current_node) {
        if !edge.semantic_kind().can_transition() || !edge.is_async() {
            continue;
        }
        if condition_holds(edge, &scope)? {
            targets.push(edge.target.clone());
        }
    }
    Ok(targets)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
