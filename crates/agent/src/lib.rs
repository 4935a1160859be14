//! Agent runtime for the mention bot.
//!
//! An [`runtime::Agent`] holds the conversation memory of one Slack thread and
//! runs a bounded tool-calling loop against an [`llm::LlmClient`]. Tools come
//! from two places: the built-in [`tools::ToolRegistry`] shared by every agent,
//! and the MCP servers opened per run as a [`toolserver::ToolServerGroup`].
//! Agents live in a [`session::SessionCache`] keyed by thread.

pub mod builtin;
pub mod llm;
pub mod prompt;
pub mod runtime;
pub mod session;
pub mod tools;
pub mod toolserver;

pub use builtin::builtin_registry;
pub use llm::{ChatMessage, LlmClient, OpenAiChatClient, ToolCall, ToolDefinition};
pub use runtime::{Agent, AgentError, AgentOutput, AgentSettings};
pub use session::SessionCache;
pub use tools::{Tool, ToolOutput, ToolRegistry};
pub use toolserver::{McpStdioConnector, ToolServerConnector, ToolServerError, ToolServerGroup};
