//! Tool definitions, calls, and results.
//!
//! The runtime turns a node's surroundings into tools: one
//! `transition_to_<target>` per eligible outbound edge, `read_<ctx>` /
//! `write_<ctx>` for reachable contexts, `spawn_async_to_<target>` for
//! `@async` edges, plus any meta-programming tools the node is entitled to.
//! The agent picks from that menu; the effect executor dispatches the calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool the agent may call during a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name within the round (e.g. `transition_to_review`)
    pub name: String,

    /// What the tool does; the agent decides from this text
    pub description: String,

    /// JSON Schema for the arguments, when the tool takes any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDefinition {
    /// Create a tool definition with name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
        }
    }

    /// Attach a JSON Schema for the arguments.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// A call the agent made to one of the offered tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Id the client assigned to this call; results echo it back
    pub id: String,

    /// Name of the tool, matching a [`ToolDefinition::name`]
    pub name: String,

    /// Arguments as a JSON object
    pub arguments: Value,
}

impl ToolCall {
    /// Create a tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of dispatching one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call this result answers
    pub call_id: String,

    /// Successful output; mutually exclusive with `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure description; mutually exclusive with `result`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// A successful result.
    pub fn success(call_id: impl Into<String>, result: Value) -> Self {
        Self {
            call_id: call_id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// A failed result.
    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// True when the call succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    /// Render for a tool message body.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"error":"unserializable tool result"}"#.to_string())
    }
}
