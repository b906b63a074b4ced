//! LLM-client integration layer.
//!
//! agentflow is an **execution runtime**, not an LLM client library. This
//! module defines the contract the runtime needs from a model - one
//! tool-calling round-trip - and nothing else. Users implement
//! [`AgentClient`] for their provider (OpenAI, Anthropic, Ollama, an
//! in-house gateway); the runtime stays provider-agnostic.
//!
//! - [`traits`] - the [`AgentClient`] trait and [`AgentResponse`]
//! - [`messages`] - serializable conversation messages
//! - [`tools`] - tool definitions, calls, and results
//! - [`scripted`] - a replay client for tests and recorded runs

pub mod messages;
pub mod scripted;
pub mod tools;
pub mod traits;

pub use messages::{Message, MessageRole};
pub use scripted::{RecordedInvocation, ScriptedAgent};
pub use tools::{ToolCall, ToolDefinition, ToolResult};
pub use traits::{AgentClient, AgentResponse};
