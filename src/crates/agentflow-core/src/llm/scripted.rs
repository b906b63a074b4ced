//! Replay client for tests and recorded runs.
//!
//! [`ScriptedAgent`] returns a fixed sequence of responses and records every
//! request it saw. Together with sequential path ids and a driver that stays
//! off the wall clock when no timeout is configured, this is what makes the
//! determinism property testable: same starting state + same script =
//! identical resulting states.

use crate::error::{FlowError, Result};
use crate::llm::messages::Message;
use crate::llm::tools::ToolDefinition;
use crate::llm::traits::{AgentClient, AgentResponse};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One request the scripted agent answered, kept for assertions.
#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    /// Messages the runtime sent
    pub messages: Vec<Message>,
    /// Tools that were on offer
    pub tools: Vec<ToolDefinition>,
    /// System prompt, if any
    pub system_prompt: Option<String>,
}

/// An [`AgentClient`] that replays a prepared script.
///
/// Responses are consumed in order; running past the end of the script is an
/// [`FlowError::AgentInvocation`] error, which in tests usually means the
/// workflow asked the agent more often than the scenario expected.
pub struct ScriptedAgent {
    responses: Mutex<VecDeque<AgentResponse>>,
    invocations: Mutex<Vec<RecordedInvocation>>,
}

impl ScriptedAgent {
    /// Create a scripted agent from responses in play order.
    pub fn new(responses: Vec<AgentResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Requests answered so far.
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().expect("scripted agent lock").clone()
    }

    /// Number of requests answered so far.
    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().expect("scripted agent lock").len()
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("scripted agent lock").len()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn invoke_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system_prompt: Option<&str>,
    ) -> Result<AgentResponse> {
        self.invocations
            .lock()
            .expect("scripted agent lock")
            .push(RecordedInvocation {
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                system_prompt: system_prompt.map(str::to_string),
            });

        self.responses
            .lock()
            .expect("scripted agent lock")
            .pop_front()
            .ok_or_else(|| {
                FlowError::AgentInvocation("scripted agent ran out of responses".to_string())
            })
    }

    fn model_id(&self) -> String {
        "scripted".to_string()
    }
}
