//! Turn execution - one agent node, decomposed into steppable round-trips.
//!
//! A **turn** is one agent round-trip plus the synchronous handling of
//! every tool call it returned. The conversation lives in
//! [`ConversationState`], which is plain serializable data: park it inside
//! `ExecutionState.turn_state`, checkpoint it, and resume days later in
//! another process.
//!
//! A turn is terminal when the response carries no tool calls, or when a
//! transition tool fired. Context writes staged during a turn commit as one
//! batch when the turn's tool handling finishes - two `write_X` calls in
//! the same round are never observable half-applied. A per-node turn limit
//! (node `max_turns` attribute, else the execution-wide limit) bounds
//! runaway loops; exceeding it fails that path only.
//!
//! Pause requests take effect strictly at turn boundaries: the driver
//! checks its pause flag between turns and parks the conversation, never
//! inside one.

use crate::context;
use crate::effects;
use crate::error::{FlowError, Result};
use crate::executor::{EffectExecutor, ProposedTransition, RoundOutcome};
use crate::llm::{Message, ToolDefinition, ToolResult};
use crate::state::ExecutionState;
use crate::effects::Effect;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The full, serializable transcript of one agent node's conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// Messages exchanged so far, oldest first
    pub messages: Vec<Message>,

    /// Tools currently on offer (refreshed at every turn start, since
    /// committed writes can change which transition conditions hold)
    pub tools: Vec<ToolDefinition>,

    /// Results of every tool call handled so far
    pub tool_results: Vec<ToolResult>,

    /// Concatenated agent text across turns
    pub accumulated_text: String,
}

impl ConversationState {
    /// Open a conversation with the rendered node prompt.
    pub fn new(prompt: impl Into<String>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            tools,
            tool_results: Vec::new(),
            accumulated_text: String::new(),
        }
    }
}

/// One in-flight agent conversation, parked between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    /// Path the conversation belongs to
    pub path_id: String,

    /// Node carrying the prompt
    pub node: String,

    /// The serializable transcript
    pub conversation: ConversationState,

    /// Turns completed so far at this node visit
    pub turn_count: u32,

    /// True when parked by an explicit pause (rather than turn-granularity
    /// stepping)
    pub waiting: bool,

    /// System prompt for every round of this conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Model identifier, for observability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TurnState {
    /// Open a conversation for a path at a decision node.
    pub fn new(
        path_id: impl Into<String>,
        node: impl Into<String>,
        prompt: impl Into<String>,
        tools: Vec<ToolDefinition>,
        system_prompt: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            path_id: path_id.into(),
            node: node.into(),
            conversation: ConversationState::new(prompt, tools),
            turn_count: 0,
            waiting: false,
            system_prompt,
            model,
        }
    }
}

/// What one turn concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The agent wants more tool rounds
    Continue,

    /// The conversation is over, possibly with a chosen transition
    Terminal {
        /// The transition the agent picked, when it picked one
        transition: Option<ProposedTransition>,
    },
}

/// Run exactly one turn: refresh the tool menu, make the round-trip,
/// handle every tool call, commit the round's writes atomically.
///
/// Errors (agent failure, handler failure, turn budget exhausted)
/// propagate to the driver, which fails the owning path.
pub async fn run_turn(
    exec: &EffectExecutor,
    state: &mut ExecutionState,
    turn: &mut TurnState,
    effects: &mut Vec<Effect>,
) -> Result<TurnOutcome> {
    // Committed writes from earlier turns may have changed which edges are
    // eligible; rebuild the menu so the agent sees current options.
    let path = state
        .path(&turn.path_id)
        .cloned()
        .ok_or_else(|| FlowError::structural(format!("unknown path '{}'", turn.path_id)))?;
    let built = effects::build_effects(state, &path, &exec.meta.tools())?;
    turn.conversation.tools = built.tools;

    let response = exec
        .client
        .invoke_with_tools(
            &turn.conversation.messages,
            &turn.conversation.tools,
            turn.system_prompt.as_deref(),
        )
        .await?;

    debug!(
        path = %turn.path_id,
        node = %turn.node,
        turn = turn.turn_count,
        tool_calls = response.tool_calls.len(),
        "agent turn"
    );

    turn.conversation.messages.push(
        Message::assistant(&response.text).with_tool_calls(response.tool_calls.clone()),
    );
    if !response.text.is_empty() {
        if !turn.conversation.accumulated_text.is_empty() {
            turn.conversation.accumulated_text.push('\n');
        }
        turn.conversation.accumulated_text.push_str(&response.text);
    }

    let mut round = RoundOutcome::default();
    for call in &response.tool_calls {
        let result = exec
            .dispatch_tool_call(
                state,
                &turn.path_id,
                call,
                &turn.conversation.tools,
                &mut round,
                effects,
            )
            .await?;
        turn.conversation
            .messages
            .push(Message::tool(&call.id, result.to_json_string()));
        turn.conversation.tool_results.push(result);
    }

    // The atomic boundary: everything this round staged commits together.
    context::commit_writes(state, &round.staged)?;

    turn.turn_count += 1;

    let outcome = if let Some(transition) = round.transition {
        TurnOutcome::Terminal {
            transition: Some(transition),
        }
    } else if response.tool_calls.is_empty() {
        TurnOutcome::Terminal { transition: None }
    } else {
        TurnOutcome::Continue
    };

    if matches!(outcome, TurnOutcome::Continue) {
        let limit = state
            .snapshot
            .node(&turn.node)
            .and_then(|n| n.max_turns())
            .unwrap_or(state.limits.max_turns);
        if turn.turn_count >= limit {
            return Err(FlowError::limit("turns", limit as u64));
        }
    }

    Ok(outcome)
}
