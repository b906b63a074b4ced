//! The execution runtime driver.
//!
//! [`FlowRuntime`] owns the collaborators (LLM client, meta-tool handler,
//! generated-code handlers, optional checkpointer) and drives executions
//! through pure state values: every entry point takes an
//! [`ExecutionState`] and returns a new one, never mutating its input.
//! There is no ambient "current execution" - two runtimes, or one runtime
//! and a test, can step the same state value independently.
//!
//! One call to [`FlowRuntime::step`] advances **every** active path by one
//! unit of work, in path-creation order: check budgets, evaluate the
//! transition, run the agent conversation or apply the structural decision,
//! commit writes and spawns, then release any barrier whose requirements
//! are now covered. Per-path errors downgrade that path to failed and never
//! abort the tick; only graph-level validation errors (which cannot occur
//! after a successful build) are fatal.
//!
//! [`FlowRuntime::step_turn`] is the turn-level entry point: it advances
//! exactly one unit of work - the pending conversation by one turn if one
//! is parked in `turn_state`, otherwise the first active path (opening a
//! conversation and running its first turn when that path needs an agent
//! decision). [`FlowRuntime::request_pause`] parks the running conversation
//! at the next turn boundary, never mid-turn.

use crate::codegen;
use crate::context;
use crate::effects::{self, Effect};
use crate::error::{FlowError, Result};
use crate::evaluator::{self, TransitionDecision};
use crate::executor::{apply_structural_decision, EffectExecutor};
use crate::graph::GraphSnapshot;
use crate::llm::AgentClient;
use crate::meta::{GraphMetaTools, MetaToolHandler};
use crate::state::{BarrierMode, ExecutionState, PathStatus, TransitionReason};
use crate::turn::{run_turn, TurnOutcome, TurnState};
use crate::visualization::{self, VisualizationState};
use agentflow_checkpoint::Checkpointer;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// Callback invoked whenever meta-programming replaces the live snapshot.
pub type DefinitionUpdateCallback = Arc<dyn Fn(&GraphSnapshot) + Send + Sync>;

/// How much work one driver call performs per agent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    /// Full node-steps; conversations run to terminal (or pause)
    Node,
    /// Exactly one turn of exactly one unit of work
    Turn,
}

/// What one driver call produced: the new state plus everything observable
/// that happened during the tick.
#[derive(Debug)]
pub struct StepReport {
    /// The new immutable state
    pub state: ExecutionState,

    /// Effects from every path processed this tick, in processing order
    pub effects: Vec<Effect>,

    /// Paths that failed this tick, with reasons
    pub errors: Vec<(String, String)>,

    /// True when nothing can advance anymore
    pub complete: bool,
}

/// Builder for [`FlowRuntime`].
pub struct FlowRuntimeBuilder {
    client: Arc<dyn AgentClient>,
    meta: Arc<dyn MetaToolHandler>,
    code_handlers: HashMap<String, Arc<dyn codegen::CodeTaskHandler>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    definition_update: Option<DefinitionUpdateCallback>,
}

impl FlowRuntimeBuilder {
    /// Swap the meta-tool collaborator (defaults to [`GraphMetaTools`]).
    pub fn with_meta_handler(mut self, handler: Arc<dyn MetaToolHandler>) -> Self {
        self.meta = handler;
        self
    }

    /// Register a generated-code handler for a node.
    pub fn with_code_handler(
        mut self,
        node: impl Into<String>,
        handler: Arc<dyn codegen::CodeTaskHandler>,
    ) -> Self {
        self.code_handlers.insert(node.into(), handler);
        self
    }

    /// Attach a persistence collaborator; a checkpoint is written after
    /// every tick.
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Register the graph-definition-update callback.
    pub fn on_definition_update(mut self, callback: DefinitionUpdateCallback) -> Self {
        self.definition_update = Some(callback);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> FlowRuntime {
        let (events, _) = broadcast::channel(64);
        FlowRuntime {
            executor: EffectExecutor {
                client: self.client,
                meta: self.meta,
                code_handlers: self.code_handlers,
            },
            checkpointer: self.checkpointer,
            events,
            definition_update: self.definition_update,
            pause_requested: AtomicBool::new(false),
        }
    }
}

/// The execution runtime driver. See the module docs.
pub struct FlowRuntime {
    executor: EffectExecutor,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    events: broadcast::Sender<ExecutionState>,
    definition_update: Option<DefinitionUpdateCallback>,
    pause_requested: AtomicBool,
}

impl FlowRuntime {
    /// Start building a runtime around an LLM client.
    pub fn builder(client: Arc<dyn AgentClient>) -> FlowRuntimeBuilder {
        FlowRuntimeBuilder {
            client,
            meta: Arc::new(GraphMetaTools),
            code_handlers: HashMap::new(),
            checkpointer: None,
            definition_update: None,
        }
    }

    /// Subscribe to state changes; every tick broadcasts the new state.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionState> {
        self.events.subscribe()
    }

    /// Subscription as an async stream, for `StreamExt`-style consumers.
    pub fn subscribe_stream(&self) -> BroadcastStream<ExecutionState> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Request a pause. Takes effect at the next turn boundary; the parked
    /// conversation lands in the returned state's `turn_state` with
    /// `waiting: true`.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Advance every active path by one unit of work.
    pub async fn step(&self, state: &ExecutionState) -> Result<StepReport> {
        self.tick(state, Granularity::Node).await
    }

    /// Advance by exactly one turn (or one structural unit of work when no
    /// conversation is pending and the next path needs none).
    pub async fn step_turn(&self, state: &ExecutionState) -> Result<StepReport> {
        self.tick(state, Granularity::Turn).await
    }

    /// Run to completion, pause, or limit. Returns the final state with
    /// all effects and errors accumulated across ticks.
    pub async fn execute(&self, state: &ExecutionState) -> Result<StepReport> {
        let mut current = state.clone();
        let mut all_effects = Vec::new();
        let mut all_errors = Vec::new();

        loop {
            if let Some(timeout_ms) = current.limits.timeout_ms {
                let elapsed =
                    (Utc::now() - current.metadata.started_at).num_milliseconds().max(0) as u64;
                if elapsed > timeout_ms {
                    warn!(elapsed, timeout_ms, "execution timed out");
                    for path_id in current.active_path_ids() {
                        let reason = format!("timeout limit exceeded ({} ms)", timeout_ms);
                        current.update_path(&path_id, |p| p.fail(&reason))?;
                        current.metadata.error_count += 1;
                        all_effects.push(Effect::Error {
                            path_id: path_id.clone(),
                            reason: reason.clone(),
                        });
                        all_errors.push((path_id, reason));
                    }
                    current.metadata.elapsed_ms = elapsed;
                    break;
                }
            }

            if current.is_complete() {
                break;
            }

            let report = self.step(&current).await?;
            current = report.state;
            all_effects.extend(report.effects);
            all_errors.extend(report.errors);

            if report.complete {
                break;
            }
            // An explicit pause parked the conversation; stop stepping.
            if current
                .turn_state
                .as_ref()
                .map(|t| t.waiting)
                .unwrap_or(false)
            {
                info!("execution paused at turn boundary");
                break;
            }
        }

        let complete = current.is_complete();
        Ok(StepReport {
            state: current,
            effects: all_effects,
            errors: all_errors,
            complete,
        })
    }

    /// Aggregated projection for UIs: current node per path, per-node visit
    /// counts, and the transitions currently on offer.
    pub fn get_visualization_state(&self, state: &ExecutionState) -> Result<VisualizationState> {
        visualization::project(state)
    }

    /// Cancel a path immediately. The path drops out of any barrier it was
    /// waiting at, and its conversation (if pending) is discarded.
    pub fn cancel_path(&self, state: &ExecutionState, path_id: &str) -> Result<ExecutionState> {
        let mut next = state.clone();
        next.update_path(path_id, |p| p.set_status(PathStatus::Cancelled))?;
        for barrier in next.barriers.values_mut() {
            barrier.waiting.remove(path_id);
            for members in barrier.group_arrivals.values_mut() {
                members.remove(path_id);
            }
        }
        if next
            .turn_state
            .as_ref()
            .map(|t| t.path_id == path_id)
            .unwrap_or(false)
        {
            next.turn_state = None;
        }
        info!(path = path_id, "path cancelled");
        Ok(next)
    }

    async fn tick(&self, state: &ExecutionState, granularity: Granularity) -> Result<StepReport> {
        let mut next = state.clone();
        next.metadata.step_count += 1;
        if next.limits.timeout_ms.is_some() {
            next.metadata.elapsed_ms =
                (Utc::now() - next.metadata.started_at).num_milliseconds().max(0) as u64;
        }

        let snapshot_before = next.snapshot.clone();
        let mut effects = Vec::new();
        let mut errors: Vec<(String, String)> = Vec::new();
        let mut pending = next.turn_state.take();

        // Turn granularity advances exactly one unit of work: the pending
        // conversation's path, or the first active path.
        let order: Vec<String> = match granularity {
            Granularity::Turn => pending
                .as_ref()
                .map(|t| vec![t.path_id.clone()])
                .unwrap_or_else(|| next.active_path_ids().into_iter().take(1).collect()),
            Granularity::Node => next.active_path_ids(),
        };

        for path_id in order {
            if next.path(&path_id).map(|p| p.status) != Some(PathStatus::Active) {
                continue;
            }
            let resume = if pending
                .as_ref()
                .map(|t| t.path_id == path_id)
                .unwrap_or(false)
            {
                pending.take()
            } else {
                None
            };
            if let Err(e) = self
                .advance_path(&mut next, &path_id, resume, granularity, &mut effects)
                .await
            {
                if e.is_fatal() {
                    return Err(e);
                }
                let reason = e.to_string();
                warn!(path = %path_id, error = %reason, "path failed");
                next.update_path(&path_id, |p| p.fail(&reason))?;
                next.metadata.error_count += 1;
                effects.push(Effect::Error {
                    path_id: path_id.clone(),
                    reason: reason.clone(),
                });
                errors.push((path_id, reason));
            }
        }

        // A conversation whose path failed or was cancelled mid-tick has
        // nowhere to resume.
        if let Some(orphan) = pending {
            effects.push(Effect::warn(format!(
                "discarded conversation for inactive path '{}'",
                orphan.path_id
            )));
        }

        self.release_barriers(&mut next, &mut effects)?;

        if !Arc::ptr_eq(&snapshot_before, &next.snapshot) {
            if let Some(callback) = &self.definition_update {
                callback(&next.snapshot);
            }
        }

        let complete = next.is_complete();
        let _ = self.events.send(next.clone());

        if let Some(checkpointer) = &self.checkpointer {
            match next.to_checkpoint() {
                Ok(payload) => {
                    if let Err(e) = checkpointer
                        .save(&next.metadata.execution_id, next.metadata.step_count, payload)
                        .await
                    {
                        effects.push(Effect::warn(format!("checkpoint save failed: {}", e)));
                    }
                }
                Err(e) => effects.push(Effect::warn(format!("checkpoint encode failed: {}", e))),
            }
        }

        Ok(StepReport {
            state: next,
            effects,
            errors,
            complete,
        })
    }

    async fn advance_path(
        &self,
        state: &mut ExecutionState,
        path_id: &str,
        resume: Option<TurnState>,
        granularity: Granularity,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        let Some(path) = state.path(path_id).cloned() else {
            return Ok(());
        };
        if path.status != PathStatus::Active {
            return Ok(());
        }

        if path.step_count >= state.limits.max_steps {
            return Err(FlowError::limit("steps", state.limits.max_steps));
        }

        if let Some(mut turn) = resume {
            turn.waiting = false;
            state.update_path(path_id, |p| p.step_count += 1)?;
            return self.run_conversation(state, turn, granularity, effects).await;
        }

        let decision = evaluator::evaluate_transition(state, &path)?;

        if decision != TransitionDecision::AgentDecision {
            state.update_path(path_id, |p| p.step_count += 1)?;
            return apply_structural_decision(&self.executor, state, path_id, decision, effects);
        }

        // One conversation slot: if a pause already parked one this tick,
        // other decision points wait for the next tick.
        if state.turn_state.is_some() {
            debug!(path = path_id, "conversation slot occupied; deferring");
            return Ok(());
        }

        state.update_path(path_id, |p| p.step_count += 1)?;

        let node = state
            .snapshot
            .node(&path.current_node)
            .cloned()
            .ok_or_else(|| {
                FlowError::structural(format!("unknown node '{}'", path.current_node))
            })?;

        // Generated-code preference: run the handler instead of the agent;
        // any failure falls back to the agent path.
        if node.prefers_code() {
            if let Some(handler) = self.executor.code_handlers.get(&node.name).cloned() {
                match codegen::run_code_path(handler.as_ref(), state, &path).await {
                    Ok(writes) => {
                        context::commit_writes(state, &writes)?;
                        state.update_path(path_id, |p| p.agent_rounds += 1)?;
                        effects.push(Effect::info(format!(
                            "node '{}' handled by generated code ({} writes)",
                            node.name,
                            writes.len()
                        )));
                        let path = state
                            .path(path_id)
                            .cloned()
                            .ok_or_else(|| FlowError::structural("path vanished".to_string()))?;
                        let decision = evaluator::evaluate_transition(state, &path)?;
                        if decision == TransitionDecision::AgentDecision {
                            // No edge fired on the code result; the agent
                            // gets its say next tick.
                            debug!(node = %node.name, "code result fired no transition");
                            return Ok(());
                        }
                        return apply_structural_decision(
                            &self.executor,
                            state,
                            path_id,
                            decision,
                            effects,
                        );
                    }
                    Err(e) => {
                        effects.push(Effect::warn(format!(
                            "code path for '{}' fell back to agent: {}",
                            node.name, e
                        )));
                    }
                }
            } else {
                effects.push(Effect::info(format!(
                    "no code handler registered for '{}'; using agent",
                    node.name
                )));
            }
        }

        let built = effects::build_effects(state, &path, &self.executor.meta.tools())?;
        let mut prompt = String::new();
        let mut system_prompt = None;
        let mut model = None;
        for effect in &built.effects {
            if let Effect::InvokeAgent {
                prompt: p,
                system_prompt: sp,
                model: m,
                ..
            } = effect
            {
                prompt = p.clone();
                system_prompt = sp.clone();
                model = m.clone();
            }
        }
        effects.extend(built.effects.clone());

        let turn = TurnState::new(
            path_id,
            &node.name,
            prompt,
            built.tools,
            system_prompt,
            Some(model.unwrap_or_else(|| self.executor.client.model_id())),
        );
        self.run_conversation(state, turn, granularity, effects).await
    }

    async fn run_conversation(
        &self,
        state: &mut ExecutionState,
        mut turn: TurnState,
        granularity: Granularity,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        loop {
            let outcome = run_turn(&self.executor, state, &mut turn, effects).await?;
            state.update_path(&turn.path_id, |p| p.agent_rounds += 1)?;

            match outcome {
                TurnOutcome::Terminal { transition } => {
                    if let Some(t) = transition {
                        let step = state.metadata.step_count;
                        info!(path = %turn.path_id, target = %t.target, "agent transition");
                        state.update_path(&turn.path_id, |p| {
                            p.enter(&t.target, step, TransitionReason::Agent)
                        })?;
                    } else {
                        // The agent finished without picking a transition;
                        // conditions it satisfied via writes may fire now.
                        let path = state.path(&turn.path_id).cloned().ok_or_else(|| {
                            FlowError::structural(format!("unknown path '{}'", turn.path_id))
                        })?;
                        if path.status == PathStatus::Active {
                            let decision = evaluator::evaluate_transition(state, &path)?;
                            if decision == TransitionDecision::AgentDecision {
                                effects.push(Effect::info(format!(
                                    "agent ended its round at '{}' without transitioning",
                                    turn.node
                                )));
                            } else {
                                apply_structural_decision(
                                    &self.executor,
                                    state,
                                    &turn.path_id,
                                    decision,
                                    effects,
                                )?;
                            }
                        }
                    }
                    return Ok(());
                }
                TurnOutcome::Continue => {
                    let paused = self.pause_requested.swap(false, Ordering::SeqCst);
                    if paused || granularity == Granularity::Turn {
                        turn.waiting = paused;
                        state.turn_state = Some(turn);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Release every barrier whose requirements are covered. A barrier
    /// releases exactly once: merge mode completes all arrivals and spawns
    /// one continuing path, all mode lets each arrival continue.
    fn release_barriers(
        &self,
        state: &mut ExecutionState,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        loop {
            let ready = state.releasable_barriers();
            if ready.is_empty() {
                return Ok(());
            }
            for name in ready {
                let Some(barrier) = state.barriers.get(&name).cloned() else {
                    continue;
                };
                let step = state.metadata.step_count;
                match barrier.mode {
                    BarrierMode::Merge => {
                        // BTreeMap order makes the continuation target and
                        // lineage deterministic.
                        let Some((first, target)) =
                            barrier.waiting.iter().next().map(|(k, v)| (k.clone(), v.clone()))
                        else {
                            continue;
                        };
                        for path_id in barrier.waiting.keys() {
                            state
                                .update_path(path_id, |p| p.set_status(PathStatus::Completed))?;
                        }
                        let merged = self.executor.spawn_path(
                            state,
                            &first,
                            &target,
                            TransitionReason::BarrierRelease,
                            None,
                            effects,
                        )?;
                        effects.push(Effect::info(format!(
                            "barrier '{}' released; merged {} paths into '{}'",
                            name,
                            barrier.waiting.len(),
                            merged
                        )));
                    }
                    BarrierMode::All => {
                        for (path_id, target) in &barrier.waiting {
                            state.update_path(path_id, |p| {
                                p.set_status(PathStatus::Active);
                                p.enter(target, step, TransitionReason::BarrierRelease);
                            })?;
                        }
                        effects.push(Effect::info(format!(
                            "barrier '{}' released {} paths",
                            name,
                            barrier.waiting.len()
                        )));
                    }
                }
                let entry = state
                    .barriers
                    .get_mut(&name)
                    .ok_or_else(|| FlowError::structural(format!("barrier '{}' vanished", name)))?;
                entry.released = true;
                entry.waiting.clear();
                info!(barrier = %name, "barrier released");
            }
        }
    }
}
