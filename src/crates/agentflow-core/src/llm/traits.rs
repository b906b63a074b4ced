//! The LLM-client contract.
//!
//! The runtime needs exactly one thing from a model: given a conversation,
//! the tools on offer, and an optional system prompt, produce text and zero
//! or more tool calls. Everything else - authentication, retries, streaming,
//! reasoning modes - is the implementation's business.
//!
//! # Implementing a client
//!
//! ```rust,ignore
//! use agentflow_core::llm::{AgentClient, AgentResponse, Message, ToolDefinition};
//! use agentflow_core::Result;
//! use async_trait::async_trait;
//!
//! struct MyClient { api_key: String }
//!
//! #[async_trait]
//! impl AgentClient for MyClient {
//!     async fn invoke_with_tools(
//!         &self,
//!         messages: &[Message],
//!         tools: &[ToolDefinition],
//!         system_prompt: Option<&str>,
//!     ) -> Result<AgentResponse> {
//!         // convert, call the provider, convert back
//!         todo!()
//!     }
//! }
//! ```

use crate::error::Result;
use crate::llm::messages::Message;
use crate::llm::tools::{ToolCall, ToolDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One agent round-trip: text plus the tool calls the agent wants executed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Free text from the agent
    pub text: String,

    /// Tool calls, in the order the agent issued them
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl AgentResponse {
    /// A text-only response (ends the conversation).
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    /// A response carrying tool calls.
    pub fn with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
        }
    }
}

/// The external LLM collaborator.
///
/// Implementations must be `Send + Sync`; the runtime holds one behind
/// `Arc<dyn AgentClient>` and shares it across every decision point.
/// Failures should surface as [`FlowError::AgentInvocation`] so the driver
/// can downgrade only the owning path.
///
/// [`FlowError::AgentInvocation`]: crate::FlowError::AgentInvocation
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run one tool-calling round-trip.
    async fn invoke_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system_prompt: Option<&str>,
    ) -> Result<AgentResponse>;

    /// Model identifier recorded into `TurnState` for observability.
    fn model_id(&self) -> String {
        "unknown".to_string()
    }
}
