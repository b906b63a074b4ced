//! Effect execution - interpreting effects and dispatching agent tool
//! calls against the state under construction.
//!
//! The [`EffectExecutor`] owns the collaborators (LLM client, meta-tool
//! handler, generated-code handlers) and provides the two interpretation
//! entry points the driver composes:
//!
//! - [`EffectExecutor::dispatch_tool_call`] - handle one tool call from an
//!   agent round: record a proposed transition, stage a context write,
//!   answer a read from the committed snapshot, spawn a detached path, or
//!   delegate to the meta handler.
//! - [`apply_structural_decision`] - apply a non-agent
//!   [`TransitionDecision`] to the state: complete, transition, park at a
//!   barrier, fork, fan out, or hand off to async paths.
//!
//! Writes staged during a round are **not** applied here; the turn executor
//! commits the whole batch after the round so multi-call rounds are atomic.
//! Any handler error propagates to the driver, which downgrades the owning
//! path to failed - sibling paths are unaffected.

use crate::codegen::CodeTaskHandler;
use crate::context::{self, StagedWrite};
use crate::effects::{self, Effect};
use crate::error::{FlowError, Result};
use crate::evaluator::{self, TransitionDecision};
use crate::llm::{AgentClient, ToolCall, ToolDefinition, ToolResult};
use crate::meta::MetaToolHandler;
use crate::state::{ExecutionState, MapContext, Path, PathStatus, TransitionReason};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A transition proposed during an agent round; recorded once the round
/// completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedTransition {
    /// Node to enter
    pub target: String,
    /// Tool that proposed it
    pub tool: String,
}

/// Everything one agent round accumulated before its atomic commit.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// Staged context writes, committed together after the round
    pub staged: Vec<StagedWrite>,

    /// The proposed transition, if a transition tool fired
    pub transition: Option<ProposedTransition>,

    /// Paths spawned during the round
    pub spawned: Vec<String>,

    /// Set when a meta tool replaced the live snapshot
    pub graph_updated: bool,
}

/// Interprets effects and tool calls. Cheap to clone; collaborators are
/// shared behind `Arc`s.
#[derive(Clone)]
pub struct EffectExecutor {
    /// The LLM collaborator
    pub client: Arc<dyn AgentClient>,

    /// The meta-programming collaborator
    pub meta: Arc<dyn MetaToolHandler>,

    /// Generated-code handlers, by node name
    pub code_handlers: HashMap<String, Arc<dyn CodeTaskHandler>>,
}

impl EffectExecutor {
    /// Dispatch one tool call from an agent round.
    ///
    /// Soft failures (unknown tool, malformed arguments, duplicate
    /// transition) come back as failed [`ToolResult`]s so the agent can
    /// correct itself next turn. Handler errors - meta-tool failures,
    /// exceeding the path budget on spawn - propagate and fail the path.
    pub async fn dispatch_tool_call(
        &self,
        state: &mut ExecutionState,
        path_id: &str,
        call: &ToolCall,
        offered_tools: &[ToolDefinition],
        round: &mut RoundOutcome,
        effects: &mut Vec<Effect>,
    ) -> Result<ToolResult> {
        let path = state
            .path(path_id)
            .cloned()
            .ok_or_else(|| FlowError::structural(format!("unknown path '{}'", path_id)))?;

        debug!(path = path_id, tool = %call.name, "dispatching tool call");

        // transition_to_*
        if let Some(target) = effects::transition_tool_target(state, &path, &call.name)? {
            if let Some(existing) = &round.transition {
                return Ok(ToolResult::failure(
                    &call.id,
                    format!(
                        "a transition to '{}' was already proposed this round",
                        existing.target
                    ),
                ));
            }
            round.transition = Some(ProposedTransition {
                target: target.clone(),
                tool: call.name.clone(),
            });
            effects.push(Effect::ProposeTransition {
                path_id: path_id.to_string(),
                target: target.clone(),
                tool: Some(call.name.clone()),
            });
            return Ok(ToolResult::success(
                &call.id,
                json!({"status": "recorded", "target": target}),
            ));
        }

        // read_* / write_*
        if let Some((ctx, writable)) = effects::context_tool_target(state, &path, &call.name) {
            if writable {
                let Some(key) = call.arguments.get("key").and_then(Value::as_str) else {
                    return Ok(ToolResult::failure(&call.id, "missing string argument 'key'"));
                };
                let Some(value) = call.arguments.get("value") else {
                    return Ok(ToolResult::failure(&call.id, "missing argument 'value'"));
                };
                round.staged.push(StagedWrite {
                    context: ctx.clone(),
                    key: key.to_string(),
                    value: value.clone(),
                });
                effects.push(Effect::StageContextWrite {
                    path_id: path_id.to_string(),
                    context: ctx,
                    key: key.to_string(),
                    value: value.clone(),
                });
                return Ok(ToolResult::success(&call.id, json!({"status": "staged"})));
            }
            // Reads observe the committed snapshot; writes staged earlier in
            // this same round are intentionally invisible.
            let fields = context::read_context(state, &ctx)?;
            return Ok(ToolResult::success(
                &call.id,
                Value::Object(fields.into_iter().collect()),
            ));
        }

        // spawn_async_to_*
        if let Some(target) = effects::spawn_tool_target(state, &path, &call.name)? {
            let new_id = self.spawn_path(
                state,
                path_id,
                &target,
                TransitionReason::AsyncSpawn,
                None,
                effects,
            )?;
            round.spawned.push(new_id.clone());

            let mut result = json!({"status": "spawned", "path_id": new_id});
            let await_first = call
                .arguments
                .get("await_first_result")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if await_first {
                let first = self.run_first_step(state, &new_id, effects).await?;
                result["first_result"] = first;
            }
            return Ok(ToolResult::success(&call.id, result));
        }

        // Meta tools, gated by capability.
        let is_meta_tool = self.meta.tools().iter().any(|t| t.name == call.name);
        if is_meta_tool && effects::meta_granted(&state.snapshot, &path.current_node) {
            let outcome = self.meta.handle(&state.snapshot, call, offered_tools)?;
            if let Some(updated) = outcome.updated_snapshot {
                info!(tool = %call.name, "meta tool updated the workflow definition");
                state.snapshot = Arc::new(updated);
                round.graph_updated = true;
                effects.push(Effect::info(format!(
                    "graph definition updated by '{}'",
                    call.name
                )));
            }
            return Ok(ToolResult::success(&call.id, outcome.result));
        }

        Ok(ToolResult::failure(
            &call.id,
            format!("unknown tool '{}'", call.name),
        ))
    }

    /// Spawn a new active path at `target` and record the effect.
    pub fn spawn_path(
        &self,
        state: &mut ExecutionState,
        origin: &str,
        target: &str,
        reason: TransitionReason,
        map_context: Option<MapContext>,
        effects: &mut Vec<Effect>,
    ) -> Result<String> {
        let new_id = state.next_path_id();
        let mut path = Path::spawned(
            new_id.clone(),
            target,
            origin,
            state.metadata.step_count,
            reason,
        );
        path.map_context = map_context;
        state.append_path(path)?;
        effects.push(Effect::SpawnPath {
            path_id: new_id.clone(),
            node: target.to_string(),
            origin: origin.to_string(),
            reason,
        });
        info!(path = %new_id, node = target, ?reason, "spawned path");
        Ok(new_id)
    }

    /// Advance a freshly spawned path by one structural unit of work so an
    /// `await_first_result` caller sees its first output. Agent decisions
    /// are not run inline; they surface as pending.
    pub async fn run_first_step(
        &self,
        state: &mut ExecutionState,
        path_id: &str,
        effects: &mut Vec<Effect>,
    ) -> Result<Value> {
        let path = state
            .path(path_id)
            .cloned()
            .ok_or_else(|| FlowError::structural(format!("unknown path '{}'", path_id)))?;

        let decision = evaluator::evaluate_transition(state, &path)?;
        let summary = match &decision {
            TransitionDecision::Complete => json!({"status": "completed"}),
            TransitionDecision::Automatic { target } => {
                json!({"status": "transitioned", "node": target})
            }
            TransitionDecision::AgentDecision => {
                return Ok(json!({"status": "pending_agent_decision", "node": path.current_node}))
            }
            TransitionDecision::BarrierArrive { name, .. } => {
                json!({"status": "waiting", "barrier": name})
            }
            TransitionDecision::ParallelFork { targets } => {
                json!({"status": "forked", "targets": targets})
            }
            TransitionDecision::MapFanOut { items, .. } => {
                json!({"status": "fanned_out", "count": items.len()})
            }
            TransitionDecision::AsyncSpawn { targets } => {
                json!({"status": "delegated", "targets": targets})
            }
            TransitionDecision::Stalled => json!({"status": "stalled"}),
        };

        state.update_path(path_id, |p| p.step_count += 1)?;
        apply_structural_decision(self, state, path_id, decision, effects)?;
        Ok(summary)
    }
}

/// Apply a non-agent decision to the state. `AgentDecision` is the driver's
/// business and is rejected here.
pub fn apply_structural_decision(
    executor: &EffectExecutor,
    state: &mut ExecutionState,
    path_id: &str,
    decision: TransitionDecision,
    effects: &mut Vec<Effect>,
) -> Result<()> {
    let step = state.metadata.step_count;
    match decision {
        TransitionDecision::Complete => {
            state.update_path(path_id, |p| p.set_status(PathStatus::Completed))?;
            effects.push(Effect::info(format!("path '{}' completed", path_id)));
        }

        TransitionDecision::Automatic { target } => {
            debug!(path = path_id, target = %target, "automatic transition");
            state.update_path(path_id, |p| {
                p.enter(&target, step, TransitionReason::Automatic)
            })?;
        }

        TransitionDecision::BarrierArrive {
            name,
            group,
            target,
        } => {
            let Some(barrier) = state.barriers.get(&name) else {
                return Err(FlowError::structural(format!(
                    "path '{}' arrived at undeclared barrier '{}'",
                    path_id, name
                )));
            };
            if barrier.released {
                // Late arrival at a one-shot barrier passes straight through.
                warn!(path = path_id, barrier = %name, "arrival after release; passing through");
                state.update_path(path_id, |p| {
                    p.enter(&target, step, TransitionReason::BarrierRelease)
                })?;
                return Ok(());
            }
            let barrier = state
                .barriers
                .get_mut(&name)
                .ok_or_else(|| FlowError::structural(format!("barrier '{}' vanished", name)))?;
            barrier.waiting.insert(path_id.to_string(), target);
            if let Some(group) = group {
                barrier
                    .group_arrivals
                    .entry(group)
                    .or_default()
                    .insert(path_id.to_string());
            }
            state.update_path(path_id, |p| p.set_status(PathStatus::Waiting))?;
            effects.push(Effect::info(format!(
                "path '{}' waiting at barrier '{}'",
                path_id, name
            )));
        }

        TransitionDecision::ParallelFork { targets } => {
            for target in &targets {
                executor.spawn_path(
                    state,
                    path_id,
                    target,
                    TransitionReason::Parallel,
                    None,
                    effects,
                )?;
            }
            state.update_path(path_id, |p| p.set_status(PathStatus::Completed))?;
            effects.push(Effect::info(format!(
                "path '{}' forked into {} paths",
                path_id,
                targets.len()
            )));
        }

        TransitionDecision::MapFanOut {
            source,
            group,
            target,
            items,
        } => {
            let count = items.len();
            for (index, item) in items.into_iter().enumerate() {
                executor.spawn_path(
                    state,
                    path_id,
                    &target,
                    TransitionReason::MapFanOut,
                    Some(MapContext {
                        source_path: path_id.to_string(),
                        source_expression: source.clone(),
                        item,
                        index,
                        group: group.clone(),
                    }),
                    effects,
                )?;
            }
            state.update_path(path_id, |p| p.set_status(PathStatus::Completed))?;
            effects.push(Effect::info(format!(
                "path '{}' fanned out over '{}' into {} paths",
                path_id, source, count
            )));
        }

        TransitionDecision::AsyncSpawn { targets } => {
            for target in &targets {
                executor.spawn_path(
                    state,
                    path_id,
                    target,
                    TransitionReason::AsyncSpawn,
                    None,
                    effects,
                )?;
            }
            // Work handed off; the spawning path is done.
            state.update_path(path_id, |p| p.set_status(PathStatus::Completed))?;
            effects.push(Effect::info(format!(
                "path '{}' delegated work to {} async paths",
                path_id,
                targets.len()
            )));
        }

        TransitionDecision::Stalled => {
            debug!(path = path_id, "no transition can fire this tick");
        }

        TransitionDecision::AgentDecision => {
            return Err(FlowError::structural(
                "agent decisions are not structural; this is a driver bug".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeAnnotation, GraphSnapshot, Node, NodeKind};
    use crate::llm::{AgentResponse, ScriptedAgent};
    use crate::meta::GraphMetaTools;
    use serde_json::json;

    fn executor() -> EffectExecutor {
        EffectExecutor {
            client: Arc::new(ScriptedAgent::new(vec![AgentResponse::text("unused")])),
            meta: Arc::new(GraphMetaTools),
            code_handlers: HashMap::new(),
        }
    }

    fn agent_state() -> ExecutionState {
        let snapshot = GraphSnapshot::new(
            vec![
                Node::new("begin", NodeKind::Start).with_attribute("prompt", json!("decide")),
                Node::new("Counter", NodeKind::Context).with_attribute("value", json!(0)),
                Node::new("review", NodeKind::Task),
                Node::new("bg", NodeKind::Task),
            ],
            vec![
                Edge::new("Counter", "begin"),
                Edge::new("begin", "Counter"),
                Edge::new("begin", "review"),
                Edge::new("begin", "bg").with_annotation(EdgeAnnotation::Async),
            ],
        );
        ExecutionState::builder(snapshot).build().unwrap()
    }

    #[tokio::test]
    async fn test_transition_tool_records_once() {
        let exec = executor();
        let mut state = agent_state();
        let mut round = RoundOutcome::default();
        let mut effects = Vec::new();
        let offered: Vec<ToolDefinition> = vec![];

        let call = ToolCall::new("c1", "transition_to_review", json!({}));
        let r = exec
            .dispatch_tool_call(&mut state, "path_0", &call, &offered, &mut round, &mut effects)
            .await
            .unwrap();
        assert!(r.is_success());
        assert_eq!(round.transition.as_ref().unwrap().target, "review");

        // A second transition in the same round is refused.
        let call2 = ToolCall::new("c2", "transition_to_review", json!({}));
        let r2 = exec
            .dispatch_tool_call(&mut state, "path_0", &call2, &offered, &mut round, &mut effects)
            .await
            .unwrap();
        assert!(!r2.is_success());
    }

    #[tokio::test]
    async fn test_write_is_staged_not_committed() {
        let exec = executor();
        let mut state = agent_state();
        let mut round = RoundOutcome::default();
        let mut effects = Vec::new();

        let call = ToolCall::new("c1", "write_Counter", json!({"key": "value", "value": 5}));
        let r = exec
            .dispatch_tool_call(&mut state, "path_0", &call, &[], &mut round, &mut effects)
            .await
            .unwrap();
        assert!(r.is_success());
        assert_eq!(round.staged.len(), 1);
        // The committed snapshot is untouched until the round commits.
        assert_eq!(state.context_state["Counter"]["value"], json!(0));

        // Reads see the committed snapshot, not the staged write.
        let call = ToolCall::new("c2", "read_Counter", json!({}));
        let r = exec
            .dispatch_tool_call(&mut state, "path_0", &call, &[], &mut round, &mut effects)
            .await
            .unwrap();
        assert_eq!(r.result.unwrap()["value"], json!(0));
    }

    #[tokio::test]
    async fn test_spawn_tool_creates_active_path() {
        let exec = executor();
        let mut state = agent_state();
        let mut round = RoundOutcome::default();
        let mut effects = Vec::new();

        let call = ToolCall::new("c1", "spawn_async_to_bg", json!({"reason": "background"}));
        let r = exec
            .dispatch_tool_call(&mut state, "path_0", &call, &[], &mut round, &mut effects)
            .await
            .unwrap();
        assert!(r.is_success());
        let spawned = state.path("path_1").unwrap();
        assert_eq!(spawned.current_node, "bg");
        assert_eq!(spawned.status, PathStatus::Active);
        assert_eq!(round.spawned, vec!["path_1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_soft_failure() {
        let exec = executor();
        let mut state = agent_state();
        let mut round = RoundOutcome::default();
        let mut effects = Vec::new();

        let call = ToolCall::new("c1", "launch_rockets", json!({}));
        let r = exec
            .dispatch_tool_call(&mut state, "path_0", &call, &[], &mut round, &mut effects)
            .await
            .unwrap();
        assert!(!r.is_success());
    }

    #[tokio::test]
    async fn test_meta_tool_requires_capability() {
        let exec = executor();
        let mut state = agent_state(); // no meta attribute anywhere
        let mut round = RoundOutcome::default();
        let mut effects = Vec::new();

        let call = ToolCall::new("c1", "inspect_graph", json!({}));
        let r = exec
            .dispatch_tool_call(&mut state, "path_0", &call, &[], &mut round, &mut effects)
            .await
            .unwrap();
        assert!(!r.is_success(), "meta tool must be refused without the capability");
    }

    #[tokio::test]
    async fn test_meta_tool_swaps_snapshot() {
        let exec = executor();
        let snapshot = GraphSnapshot::new(
            vec![
                Node::new("begin", NodeKind::Start)
                    .with_attribute("prompt", json!("decide"))
                    .with_attribute("meta", json!(true)),
                Node::new("done", NodeKind::End),
            ],
            vec![Edge::new("begin", "done")],
        );
        let mut state = ExecutionState::builder(snapshot).build().unwrap();
        let before = state.snapshot.clone();
        let mut round = RoundOutcome::default();
        let mut effects = Vec::new();

        let call = ToolCall::new(
            "c1",
            "add_node",
            json!({"name": "audit", "kind": "task"}),
        );
        let r = exec
            .dispatch_tool_call(&mut state, "path_0", &call, &[], &mut round, &mut effects)
            .await
            .unwrap();
        assert!(r.is_success());
        assert!(round.graph_updated);
        assert!(!Arc::ptr_eq(&before, &state.snapshot));
        assert!(state.snapshot.node("audit").is_some());
        assert!(before.node("audit").is_none());
    }

    #[test]
    fn test_apply_complete_and_fork() {
        let exec = executor();
        let snapshot = GraphSnapshot::new(
            vec![
                Node::new("begin", NodeKind::Start),
                Node::new("left", NodeKind::Task),
                Node::new("right", NodeKind::Task),
            ],
            vec![
                Edge::new("begin", "left").with_annotation(EdgeAnnotation::Parallel),
                Edge::new("begin", "right").with_annotation(EdgeAnnotation::Parallel),
            ],
        );
        let mut state = ExecutionState::builder(snapshot).build().unwrap();
        let mut effects = Vec::new();

        apply_structural_decision(
            &exec,
            &mut state,
            "path_0",
            TransitionDecision::ParallelFork {
                targets: vec!["left".into(), "right".into()],
            },
            &mut effects,
        )
        .unwrap();

        assert_eq!(state.paths.len(), 3);
        assert_eq!(state.path("path_0").unwrap().status, PathStatus::Completed);
        assert_eq!(state.path("path_1").unwrap().current_node, "left");
        assert_eq!(state.path("path_2").unwrap().current_node, "right");
    }

    #[test]
    fn test_arrival_at_undeclared_barrier_errors() {
        let exec = executor();
        let snapshot = GraphSnapshot::new(
            vec![
                Node::new("begin", NodeKind::Start),
                Node::new("join", NodeKind::Task),
            ],
            vec![Edge::new("begin", "join")],
        );
        let mut state = ExecutionState::builder(snapshot).build().unwrap();
        let mut effects = Vec::new();

        let err = apply_structural_decision(
            &exec,
            &mut state,
            "path_0",
            TransitionDecision::BarrierArrive {
                name: "ghost".into(),
                group: None,
                target: "join".into(),
            },
            &mut effects,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::Structural(_)));
    }
}
