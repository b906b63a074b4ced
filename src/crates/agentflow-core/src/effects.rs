//! Effects as data, and the builder that produces them.
//!
//! The runtime never performs a side effect inline. Evaluating a node
//! produces [`Effect`] values - plain, serializable descriptions of what
//! should happen - plus the [`ToolDefinition`]s exposed to the agent for
//! that round. The effect executor interprets them; nothing in this module
//! touches a collaborator.
//!
//! For an agent-decision node the builder assembles the round's tool menu:
//!
//! - `transition_to_<target>` - one per eligible outbound edge whose
//!   condition currently holds
//! - `read_<ctx>` / `write_<ctx>` - per reachable context (declared data
//!   edges, plus inherited read-only scope)
//! - `spawn_async_to_<target>` - one per satisfied `@async` edge
//! - meta-programming tools - only when the node or an enclosing scope
//!   grants the `meta` capability

use crate::context;
use crate::error::Result;
use crate::evaluator;
use crate::expr;
use crate::graph::GraphSnapshot;
use crate::llm::ToolDefinition;
use crate::state::{ExecutionState, Path, TransitionReason};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Severity of a [`Effect::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Normal progress
    Info,
    /// Something odd but survivable
    Warn,
    /// A path-level failure
    Error,
}

/// A data-only description of a side effect. Interpreted by the effect
/// executor, never self-executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    /// Surface a message to the caller (and the tracing subscriber).
    Log {
        /// Severity
        level: LogLevel,
        /// Message text
        message: String,
    },

    /// Run an agent round for a path parked at a decision node.
    InvokeAgent {
        /// Path awaiting the decision
        path_id: String,
        /// Node carrying the prompt
        node: String,
        /// Rendered prompt (templates already substituted)
        prompt: String,
        /// Optional system prompt from the node
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        /// Model override from the node
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Buffer one field-level context write for the round's atomic commit.
    StageContextWrite {
        /// Path whose round staged the write
        path_id: String,
        /// Context node name
        context: String,
        /// Field name
        key: String,
        /// New value
        value: Value,
    },

    /// A new path was created.
    SpawnPath {
        /// Id of the new path
        path_id: String,
        /// Node the new path starts at
        node: String,
        /// Path whose evaluation caused the spawn
        origin: String,
        /// Why the spawn happened
        reason: TransitionReason,
    },

    /// A transition was proposed (by the agent or the evaluator); recorded
    /// once the round completes.
    ProposeTransition {
        /// Path proposing to move
        path_id: String,
        /// Node to enter
        target: String,
        /// Tool that proposed it, when agent-driven
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },

    /// A per-path error; the owning path is downgraded to failed.
    Error {
        /// Path that failed
        path_id: String,
        /// Failure reason
        reason: String,
    },
}

impl Effect {
    /// Shorthand for an info log.
    pub fn info(message: impl Into<String>) -> Self {
        Effect::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    /// Shorthand for a warning log.
    pub fn warn(message: impl Into<String>) -> Self {
        Effect::Log {
            level: LogLevel::Warn,
            message: message.into(),
        }
    }
}

/// What the builder produced for one node round.
#[derive(Debug, Clone, Default)]
pub struct BuiltEffects {
    /// Effects to interpret, in order
    pub effects: Vec<Effect>,
    /// Tools exposed to the agent for this round
    pub tools: Vec<ToolDefinition>,
}

/// Make a node/context name safe inside a tool name.
pub fn sanitize_tool_suffix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// True when `node` (or an enclosing scope node) grants the meta
/// capability.
pub fn meta_granted(snapshot: &GraphSnapshot, node_name: &str) -> bool {
    let Some(node) = snapshot.node(node_name) else {
        return false;
    };
    if node.grants_meta() {
        return true;
    }
    node.scope_ancestors()
        .iter()
        .filter_map(|a| snapshot.node(a))
        .any(|n| n.grants_meta())
}

/// Build the effects and tool menu for an agent round at the path's
/// current node. Pure: reads state, produces data.
///
/// `meta_tools` is the meta collaborator's tool list; it is only included
/// when the node is entitled to it, so passing it unconditionally is fine.
pub fn build_effects(
    state: &ExecutionState,
    path: &Path,
    meta_tools: &[ToolDefinition],
) -> Result<BuiltEffects> {
    let snapshot = &state.snapshot;
    let node = snapshot.node(&path.current_node).ok_or_else(|| {
        crate::error::FlowError::structural(format!("unknown node '{}'", path.current_node))
    })?;

    let scope = context::evaluation_scope(state, Some(path));
    let prompt = node
        .prompt()
        .map(|p| expr::render_template(p, &scope))
        .unwrap_or_default();

    let mut tools = Vec::new();

    for target in evaluator::eligible_agent_transitions(state, path)? {
        tools.push(
            ToolDefinition::new(
                format!("transition_to_{}", sanitize_tool_suffix(&target)),
                format!("Finish this node and transition to '{}'.", target),
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why this transition"}
                }
            })),
        );
    }

    for ctx in context::readable_contexts(snapshot, node) {
        tools.push(
            ToolDefinition::new(
                format!("read_{}", sanitize_tool_suffix(&ctx)),
                format!("Read the current fields of context '{}'.", ctx),
            )
            .with_parameters(json!({"type": "object", "properties": {}})),
        );
    }

    for ctx in context::writable_contexts(snapshot, node) {
        tools.push(
            ToolDefinition::new(
                format!("write_{}", sanitize_tool_suffix(&ctx)),
                format!(
                    "Stage a write to one field of context '{}'. All writes from \
                     this round commit together after the round.",
                    ctx
                ),
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Field to write"},
                    "value": {"description": "New value"}
                },
                "required": ["key", "value"]
            })),
        );
    }

    for target in evaluator::agent_async_targets(state, path)? {
        tools.push(
            ToolDefinition::new(
                format!("spawn_async_to_{}", sanitize_tool_suffix(&target)),
                format!(
                    "Spawn a detached path at '{}' that runs independently of \
                     this one.",
                    target
                ),
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why the spawn"},
                    "await_first_result": {
                        "type": "boolean",
                        "description": "Run the spawned path's first step now and return its output"
                    }
                }
            })),
        );
    }

    if meta_granted(snapshot, &node.name) {
        tools.extend(meta_tools.iter().cloned());
    }

    let effects = vec![
        Effect::info(format!(
            "path '{}' awaiting agent decision at '{}'",
            path.id, node.name
        )),
        Effect::InvokeAgent {
            path_id: path.id.clone(),
            node: node.name.clone(),
            prompt,
            system_prompt: node.attr_str("system_prompt").map(str::to_string),
            model: node.attr_str("model").map(str::to_string),
        },
    ];

    Ok(BuiltEffects { effects, tools })
}

/// Resolve a `transition_to_*` tool name back to its target node.
pub fn transition_tool_target(
    state: &ExecutionState,
    path: &Path,
    tool_name: &str,
) -> Result<Option<String>> {
    for target in evaluator::eligible_agent_transitions(state, path)? {
        if tool_name == format!("transition_to_{}", sanitize_tool_suffix(&target)) {
            return Ok(Some(target));
        }
    }
    Ok(None)
}

/// Resolve a `spawn_async_to_*` tool name back to its target node.
pub fn spawn_tool_target(
    state: &ExecutionState,
    path: &Path,
    tool_name: &str,
) -> Result<Option<String>> {
    for target in evaluator::agent_async_targets(state, path)? {
        if tool_name == format!("spawn_async_to_{}", sanitize_tool_suffix(&target)) {
            return Ok(Some(target));
        }
    }
    Ok(None)
}

/// Resolve a `read_*`/`write_*` tool name back to its context, honoring the
/// access rule the tool was built under.
pub fn context_tool_target(
    state: &ExecutionState,
    path: &Path,
    tool_name: &str,
) -> Option<(String, bool)> {
    let node = state.snapshot.node(&path.current_node)?;
    if let Some(rest) = tool_name.strip_prefix("read_") {
        for ctx in context::readable_contexts(&state.snapshot, node) {
            if sanitize_tool_suffix(&ctx) == rest {
                return Some((ctx, false));
            }
        }
    }
    if let Some(rest) = tool_name.strip_prefix("write_") {
        for ctx in context::writable_contexts(&state.snapshot, node) {
            if sanitize_tool_suffix(&ctx) == rest {
                return Some((ctx, true));
            }
        }
    }
    None
}
