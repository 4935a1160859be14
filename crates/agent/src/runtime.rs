use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::llm::{ChatMessage, LlmClient, ToolCall, ToolDefinition};
use crate::toolserver::ToolServerGroup;
use crate::tools::{ToolOutput, ToolRegistry};

#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub name: String,
    pub instructions: String,
    pub max_turns: u32,
    pub max_history: usize,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model request failed: {0}")]
    Llm(String),
    #[error("agent stopped after {0} turns without a final answer")]
    TurnLimit(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub name: String,
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentOutput {
    pub final_text: String,
    pub turns: u32,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// One conversation partner with its own memory. Runs are serialized by the
/// caller; memory only changes when a run finishes successfully.
pub struct Agent {
    settings: AgentSettings,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    history: Vec<ChatMessage>,
}

impl Agent {
    pub fn new(settings: AgentSettings, llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>) -> Self {
        Self { settings, llm, tools, history: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn instructions(&self) -> &str {
        &self.settings.instructions
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub async fn run(
        &mut self,
        input: &str,
        servers: &ToolServerGroup,
    ) -> Result<AgentOutput, AgentError> {
        let definitions = self.tool_definitions(servers);
        let mut transcript = self.history.clone();
        transcript.push(ChatMessage::user(input));
        let mut tool_calls = Vec::new();

        for turn in 1..=self.settings.max_turns {
            let mut messages = Vec::with_capacity(transcript.len() + 1);
            messages.push(ChatMessage::system(self.settings.instructions.clone()));
            messages.extend(transcript.iter().cloned());

            let reply = self
                .llm
                .chat(&messages, &definitions)
                .await
                .map_err(|error| AgentError::Llm(format!("{error:#}")))?;

            let requested = reply.requested_tools().to_vec();
            if requested.is_empty() {
                let final_text = reply.content.clone().unwrap_or_default();
                transcript.push(reply);
                self.history = transcript;
                self.trim_history();
                info!(
                    event_name = "agent.run.completed",
                    agent = %self.settings.name,
                    turns = turn,
                    tool_calls = tool_calls.len(),
                    "agent run completed"
                );
                return Ok(AgentOutput { final_text, turns: turn, tool_calls });
            }

            transcript.push(reply);
            for call in requested {
                let output = self.dispatch(&call, servers).await;
                debug!(
                    event_name = "agent.tool.called",
                    tool = %call.function.name,
                    is_error = output.is_error(),
                    "tool call finished"
                );
                tool_calls.push(ToolCallRecord {
                    name: call.function.name.clone(),
                    is_error: output.is_error(),
                });
                transcript.push(ChatMessage::tool(call.id, output.to_message_text()));
            }
        }

        Err(AgentError::TurnLimit(self.settings.max_turns))
    }

    /// Built-ins shadow tool-server tools of the same name.
    fn tool_definitions(&self, servers: &ToolServerGroup) -> Vec<ToolDefinition> {
        let mut definitions = self.tools.definitions();
        definitions.extend(
            servers.definitions().into_iter().filter(|definition| !self.tools.contains(&definition.name)),
        );
        definitions
    }

    async fn dispatch(&self, call: &ToolCall, servers: &ToolServerGroup) -> ToolOutput {
        let name = call.function.name.as_str();
        let arguments = match parse_arguments(&call.function.arguments) {
            Ok(arguments) => arguments,
            Err(message) => return ToolOutput::Error(message),
        };

        if self.tools.contains(name) {
            return self.tools.invoke(name, arguments).await;
        }

        match servers.call(name, arguments).await {
            Ok(output) => output,
            Err(error) => ToolOutput::Error(error.to_string()),
        }
    }

    /// Drops the oldest messages beyond the limit. The cut always lands on a
    /// user message so memory never starts mid tool exchange; when the window
    /// holds no user message, the latest exchange is kept whole.
    fn trim_history(&mut self) {
        let max = self.settings.max_history;
        if max == 0 || self.history.len() <= max {
            return;
        }

        let window_start = self.history.len() - max;
        let is_user = |message: &ChatMessage| message.role == "user";
        let start = self.history[window_start..]
            .iter()
            .position(is_user)
            .map(|offset| window_start + offset)
            .or_else(|| self.history[..window_start].iter().rposition(is_user))
            .unwrap_or(window_start);
        self.history.drain(..start);
    }
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(raw).map_err(|error| format!("invalid JSON arguments: {error}"))
}
