//! Error types for workflow execution.
//!
//! All runtime failures flow through [`FlowError`]. The taxonomy matters for
//! propagation: only [`FlowError::Validation`] (a malformed graph) aborts an
//! execution before any path runs. Every other variant is caught at the
//! path-step boundary by the driver, which downgrades the owning path to
//! `Failed` and keeps the overall `step` call alive - sibling paths never see
//! their neighbor's errors.
//!
//! # Error taxonomy
//!
//! ```text
//! FlowError
//! ├── Validation        - malformed graph (no start node, dangling edges,
//! │                       unreachable nodes); aborts before execution
//! ├── Structural        - misconfigured barrier/group, bad map source
//! ├── LimitExceeded     - steps / turns / paths / timeout budget exhausted
//! ├── ToolExecution     - a dispatched tool call failed
//! ├── AgentInvocation   - the LLM-client collaborator failed
//! ├── SchemaValidation  - generated-code input/output contract mismatch
//! ├── Expression        - condition expression could not be parsed
//! ├── Serialization     - state is not plain JSON
//! ├── Yaml              - snapshot document parsing
//! ├── Checkpoint        - persistence collaborator errors
//! └── Io                - file system errors
//! ```

use thiserror::Error;

/// Convenience result type using [`FlowError`].
pub type Result<T> = std::result::Result<T, FlowError>;

/// All errors the execution runtime can produce.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Graph-level validation failed.
    ///
    /// The only error class that aborts an execution before any path runs:
    /// a graph with no start node, an edge referencing a missing node, or
    /// nodes unreachable from every start.
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// A synchronization primitive is misconfigured.
    ///
    /// Raised when a path arrives at a barrier nobody declared requirements
    /// for, when a `@map` source resolves to a non-array, or when a group
    /// reference never matches any path.
    #[error("Structural error: {0}")]
    Structural(String),

    /// A configured execution budget was exhausted.
    #[error("{kind} limit exceeded (limit: {limit})")]
    LimitExceeded {
        /// Which budget ran out ("steps", "turns", "paths", "timeout")
        kind: String,
        /// The configured bound
        limit: u64,
    },

    /// A tool call dispatched during an agent round failed.
    #[error("Tool '{tool}' execution failed: {error}")]
    ToolExecution {
        /// Name of the tool that failed
        tool: String,
        /// Failure description
        error: String,
    },

    /// The LLM-client collaborator returned an error.
    #[error("Agent invocation failed: {0}")]
    AgentInvocation(String),

    /// Generated-code input or output violated its declared schema.
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    /// A condition expression could not be parsed.
    ///
    /// Note that *undefined fields* inside a parseable expression are not an
    /// error - they evaluate to null and are falsy.
    #[error("Expression error: {0}")]
    Expression(String),

    /// State could not be serialized to or from plain JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A YAML snapshot document could not be parsed.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Persistence collaborator error.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] agentflow_checkpoint::CheckpointError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Create a tool-execution error with context.
    pub fn tool_execution(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            error: error.into(),
        }
    }

    /// Create a limit-exceeded error.
    pub fn limit(kind: impl Into<String>, limit: u64) -> Self {
        Self::LimitExceeded {
            kind: kind.into(),
            limit,
        }
    }

    /// Create a structural error.
    pub fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    /// True for errors that abort the whole execution rather than one path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
