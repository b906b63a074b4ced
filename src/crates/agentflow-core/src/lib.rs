//! # agentflow-core - Execution Runtime for Agent-Driven Workflow Graphs
//!
//! **A concurrent, multi-path, immutable-state interpreter** for workflow
//! programs expressed as directed graphs of nodes (states, tasks, tools,
//! contexts) and edges. Individual decision points may be delegated to an
//! external LLM agent, exposed as a steppable, pausable, turn-by-turn
//! conversation protocol.
//!
//! ## Overview
//!
//! `agentflow-core` executes a parsed workflow definition
//! ([`GraphSnapshot`]) against an immutable [`ExecutionState`]:
//!
//! - **Multi-path execution** - independent paths advance through the graph
//!   in cooperative rounds; one [`FlowRuntime::step`] call moves every
//!   active path by one unit of work
//! - **Synchronization** - named barriers (`@barrier`), static forks
//!   (`@parallel`), detached spawns (`@async`), and data-driven fan-out
//!   (`@map`)
//! - **Agent decision points** - nodes with prompts hand control to an LLM
//!   through a tool menu (`transition_to_*`, `read_*`/`write_*`,
//!   `spawn_async_to_*`, meta tools)
//! - **Effects as data** - side effects are described by [`Effect`] values
//!   and interpreted, never self-executing
//! - **Turn-level stepping** - agent conversations decompose into
//!   serializable turns that pause at boundaries and survive process
//!   restarts
//! - **Atomic context writes** - everything an agent round stages commits
//!   together, never observable half-applied
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agentflow_core::{ExecutionState, FlowRuntime, GraphSnapshot};
//! use std::sync::Arc;
//!
//! // The graph usually comes from the external DSL parser.
//! let snapshot = GraphSnapshot::from_yaml(include_str!("workflow.yaml"))?;
//!
//! let state = ExecutionState::builder(snapshot).build()?;
//! let runtime = FlowRuntime::builder(Arc::new(MyLlmClient::new())).build();
//!
//! // Run to completion...
//! let report = runtime.execute(&state).await?;
//! println!("complete: {}, errors: {}", report.complete, report.errors.len());
//!
//! // ...or drive it one tick at a time.
//! let report = runtime.step(&state).await?;
//! let next = report.state; // the input `state` is untouched
//! ```
//!
//! ## Architecture
//!
//! ```text
//!              ┌────────────────────────────────────────┐
//!              │            FlowRuntime                 │
//!              │  step() / step_turn() / execute()      │
//!              └──────────────────┬─────────────────────┘
//!                                 │ per active path
//!                                 ▼
//!              ┌────────────────────────────────────────┐
//!              │        Transition Evaluator            │
//!              │  complete / automatic / agent /        │
//!              │  barrier / parallel / map / async      │
//!              └───────┬──────────────────┬─────────────┘
//!            structural│                  │agent decision
//!                      ▼                  ▼
//!        ┌──────────────────┐   ┌──────────────────────┐
//!        │ Effect Executor  │   │   Effect Builder     │
//!        │ apply decision,  │   │ tool menu + effects  │
//!        │ spawn paths      │   └──────────┬───────────┘
//!        └────────┬─────────┘              ▼
//!                 │             ┌──────────────────────┐
//!                 │             │    Turn Executor     │
//!                 │             │ one round-trip per   │
//!                 │             │ turn, atomic commit  │
//!                 │             └──────────┬───────────┘
//!                 ▼                        ▼
//!              ┌────────────────────────────────────────┐
//!              │     State & Context Builder            │
//!              │  functional updates, staged writes,    │
//!              │  path creation, barrier bookkeeping    │
//!              └────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Core APIs (start here)
//! - [`graph`] - [`GraphSnapshot`], nodes, edges, semantic kinds
//! - [`state`] - [`ExecutionState`], paths, barriers, limits
//! - [`runtime`] - [`FlowRuntime`] driver and [`StepReport`]
//!
//! ### Execution internals
//! - [`evaluator`] - transition decisions
//! - [`effects`] - effects as data, tool-menu construction
//! - [`executor`] - effect interpretation and tool dispatch
//! - [`turn`] - steppable agent conversations
//! - [`context`] - context values, staged writes, evaluation scope
//! - [`expr`] - condition expressions and prompt templates
//!
//! ### Collaborator seams
//! - [`llm`] - the [`AgentClient`] contract and a scripted replay client
//! - [`meta`] - meta-programming tools over the live definition
//! - [`codegen`] - generated-code execution path with schema validation
//! - [`visualization`] - aggregated projection for UIs
//!
//! ## Design Notes
//!
//! - Nodes and edges are addressed by name with index lookups, never live
//!   pointers, so state stays acyclic and checkpointable
//! - There is no ambient runtime: every entry point threads an explicit
//!   [`ExecutionState`] value and returns a new one
//! - Node and edge kinds are closed enums handled exhaustively in the
//!   evaluator
//! - Agent conversations are explicit [`TurnState`] values with discrete
//!   turn boundaries, not coroutines, so pause/resume survives restarts
//! - Undefined fields in condition expressions are falsy, never an error
//!
//! ## See Also
//!
//! - [`agentflow_checkpoint`] - persistence collaborator (save/restore
//!   opaque plain-JSON execution state)

pub mod codegen;
pub mod context;
pub mod effects;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod llm;
pub mod meta;
pub mod runtime;
pub mod state;
pub mod turn;
pub mod visualization;

// Re-export main types
pub use codegen::CodeTaskHandler;
pub use context::StagedWrite;
pub use effects::{BuiltEffects, Effect, LogLevel};
pub use error::{FlowError, Result};
pub use evaluator::TransitionDecision;
pub use executor::{EffectExecutor, ProposedTransition, RoundOutcome};
pub use graph::{Edge, EdgeAnnotation, EdgeKind, GraphSnapshot, Node, NodeKind};
pub use llm::{
    AgentClient, AgentResponse, Message, MessageRole, ScriptedAgent, ToolCall, ToolDefinition,
    ToolResult,
};
pub use meta::{GraphMetaTools, MetaOutcome, MetaToolHandler};
pub use runtime::{DefinitionUpdateCallback, FlowRuntime, FlowRuntimeBuilder, StepReport};
pub use state::{
    BarrierMode, BarrierState, ExecutionMetadata, ExecutionState, ExecutionStateBuilder, Limits,
    MapContext, Path, PathStatus, TransitionReason, TransitionRecord, STATE_SCHEMA_VERSION,
};
pub use turn::{ConversationState, TurnOutcome, TurnState};
pub use visualization::{OfferedTransition, PathView, VisualizationState};
