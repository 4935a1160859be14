use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mentionbot_core::config::ToolServerConfig;
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::llm::ToolDefinition;
use crate::tools::ToolOutput;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("failed to start tool server `{name}`: {message}")]
    Launch { name: String, message: String },
    #[error("tool server `{name}` did not answer within {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
    #[error("tool server `{name}` failed: {message}")]
    Protocol { name: String, message: String },
    #[error("no tool server provides `{0}`")]
    UnknownTool(String),
}

/// A running external tool server.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;
    fn tools(&self) -> &[ToolDefinition];
    async fn call(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ToolServerError>;
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Box<dyn ToolServer>, ToolServerError>;
}

/// Tool servers opened for one agent run.
#[derive(Default)]
pub struct ToolServerGroup {
    servers: Vec<Box<dyn ToolServer>>,
}

impl ToolServerGroup {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Connects every configured server in name order. If one fails, the ones
    /// already running are closed before the error is returned.
    pub async fn open(
        connector: &dyn ToolServerConnector,
        configs: &BTreeMap<String, ToolServerConfig>,
        default_timeout: Duration,
    ) -> Result<Self, ToolServerError> {
        let mut group = Self::empty();

        for (name, config) in configs {
            let timeout = config.timeout_secs.map(Duration::from_secs).unwrap_or(default_timeout);
            match connector.connect(name, config, timeout).await {
                Ok(server) => {
                    debug!(
                        event_name = "agent.tool_server.connected",
                        server = %name,
                        tools = server.tools().len(),
                        "tool server connected"
                    );
                    group.servers.push(server);
                }
                Err(error) => {
                    warn!(
                        event_name = "agent.tool_server.connect_failed",
                        server = %name,
                        error = %error,
                        "tool server failed to start"
                    );
                    group.close().await;
                    return Err(error);
                }
            }
        }

        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        self.servers
            .iter()
            .flat_map(|server| server.tools().iter().cloned())
            .filter(|definition| seen.insert(definition.name.clone()))
            .collect()
    }

    pub fn provides(&self, tool: &str) -> bool {
        self.find(tool).is_some()
    }

    pub async fn call(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ToolServerError> {
        let server = self.find(tool).ok_or_else(|| ToolServerError::UnknownTool(tool.to_string()))?;
        server.call(tool, arguments).await
    }

    pub async fn close(self) {
        for server in self.servers {
            let name = server.name().to_string();
            server.close().await;
            debug!(event_name = "agent.tool_server.closed", server = %name, "tool server closed");
        }
    }

    fn find(&self, tool: &str) -> Option<&dyn ToolServer> {
        self.servers
            .iter()
            .find(|server| server.tools().iter().any(|definition| definition.name == tool))
            .map(|server| server.as_ref())
    }
}

/// Launches MCP servers as child processes speaking JSON-RPC over stdio.
/// Tool lists are cached per server name for the life of the connector.
#[derive(Default)]
pub struct McpStdioConnector {
    tool_cache: Mutex<HashMap<String, Vec<ToolDefinition>>>,
}

impl McpStdioConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached_tools(&self, name: &str) -> Option<Vec<ToolDefinition>> {
        self.tool_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).get(name).cloned()
    }

    fn store_tools(&self, name: &str, tools: Vec<ToolDefinition>) {
        self.tool_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), tools);
    }
}

#[async_trait]
impl ToolServerConnector for McpStdioConnector {
    async fn connect(
        &self,
        name: &str,
        config: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Box<dyn ToolServer>, ToolServerError> {
        let mut command = Command::new(&config.command);
        command.args(&config.args).envs(&config.env).kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let launch_error =
            |message: String| ToolServerError::Launch { name: name.to_string(), message };
        let timeout_error =
            || ToolServerError::Timeout { name: name.to_string(), timeout_secs: timeout.as_secs() };

        let transport =
            TokioChildProcess::new(command).map_err(|error| launch_error(error.to_string()))?;
        let service = tokio::time::timeout(timeout, ().serve(transport))
            .await
            .map_err(|_| timeout_error())?
            .map_err(|error| launch_error(error.to_string()))?;

        let tools = match self.cached_tools(name) {
            Some(tools) => tools,
            None => {
                let listing = tokio::time::timeout(timeout, service.list_all_tools()).await;
                let listed = match listing {
                    Ok(Ok(listed)) => listed,
                    Ok(Err(error)) => {
                        let _ = service.cancel().await;
                        return Err(ToolServerError::Protocol {
                            name: name.to_string(),
                            message: error.to_string(),
                        });
                    }
                    Err(_) => {
                        let _ = service.cancel().await;
                        return Err(timeout_error());
                    }
                };
                let tools: Vec<ToolDefinition> = listed
                    .iter()
                    .filter_map(|tool| serde_json::to_value(tool).ok())
                    .filter_map(|tool| definition_from_listing(&tool))
                    .collect();
                self.store_tools(name, tools.clone());
                tools
            }
        };

        info!(
            event_name = "agent.tool_server.ready",
            server = %name,
            tools = tools.len(),
            "tool server ready"
        );

        Ok(Box::new(McpStdioServer { name: name.to_string(), service, tools, timeout }))
    }
}

struct McpStdioServer {
    name: String,
    service: RunningService<RoleClient, ()>,
    tools: Vec<ToolDefinition>,
    timeout: Duration,
}

#[async_trait]
impl ToolServer for McpStdioServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ToolServerError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        let request = CallToolRequestParam { name: Cow::Owned(tool.to_string()), arguments };

        let result = tokio::time::timeout(self.timeout, self.service.call_tool(request))
            .await
            .map_err(|_| ToolServerError::Timeout {
                name: self.name.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|error| ToolServerError::Protocol {
                name: self.name.clone(),
                message: error.to_string(),
            })?;

        let payload = serde_json::to_value(&result).map_err(|error| ToolServerError::Protocol {
            name: self.name.clone(),
            message: error.to_string(),
        })?;
        Ok(output_from_result(&payload))
    }

    async fn close(self: Box<Self>) {
        let name = self.name.clone();
        match tokio::time::timeout(CLOSE_TIMEOUT, self.service.cancel()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                warn!(event_name = "agent.tool_server.close_failed", server = %name, error = %error, "tool server did not shut down cleanly");
            }
            Err(_) => {
                warn!(event_name = "agent.tool_server.close_timeout", server = %name, "tool server shutdown timed out");
            }
        }
    }
}

fn definition_from_listing(tool: &Value) -> Option<ToolDefinition> {
    let name = tool.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let parameters = match tool.get("inputSchema") {
        Some(Value::Object(schema)) => Value::Object(schema.clone()),
        _ => {
            let mut schema = Map::new();
            schema.insert("type".to_string(), Value::String("object".to_string()));
            Value::Object(schema)
        }
    };

    Some(ToolDefinition {
        name: name.to_string(),
        description: tool.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
        parameters,
    })
}

/// Text blocks are joined with newlines; structured content is used when no
/// text came back. `isError` results become `ToolOutput::Error`.
fn output_from_result(result: &Value) -> ToolOutput {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let body = if text.is_empty() {
        match result.get("structuredContent") {
            Some(structured) if !structured.is_null() => structured.to_string(),
            _ => String::new(),
        }
    } else {
        text
    };

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        ToolOutput::Error(body)
    } else {
        ToolOutput::Value(Value::String(body))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use mentionbot_core::config::ToolServerConfig;
    use serde_json::{json, Value};

    use super::{
        definition_from_listing, output_from_result, ToolServer, ToolServerConnector,
        ToolServerError, ToolServerGroup,
    };
    use crate::llm::ToolDefinition;
    use crate::tools::ToolOutput;

    #[derive(Default)]
    struct Ledger {
        opened: Mutex<Vec<String>>,
        closed: Mutex<Vec<String>>,
        timeouts: Mutex<Vec<(String, u64)>>,
    }

    struct FakeServer {
        name: String,
        tools: Vec<ToolDefinition>,
        ledger: Arc<Ledger>,
    }

    #[async_trait]
    impl ToolServer for FakeServer {
        fn name(&self) -> &str {
            &self.name
        }

        fn tools(&self) -> &[ToolDefinition] {
            &self.tools
        }

        async fn call(&self, tool: &str, arguments: Value) -> Result<ToolOutput, ToolServerError> {
            Ok(ToolOutput::Value(json!(format!("{}:{tool}:{arguments}", self.name))))
        }

        async fn close(self: Box<Self>) {
            self.ledger.closed.lock().expect("closed lock").push(self.name.clone());
        }
    }

    struct FakeConnector {
        ledger: Arc<Ledger>,
        failing: Option<&'static str>,
    }

    #[async_trait]
    impl ToolServerConnector for FakeConnector {
        async fn connect(
            &self,
            name: &str,
            config: &ToolServerConfig,
            timeout: Duration,
        ) -> Result<Box<dyn ToolServer>, ToolServerError> {
            self.ledger.timeouts.lock().expect("timeouts lock").push((name.to_string(), timeout.as_secs()));
            if self.failing == Some(name) {
                return Err(ToolServerError::Launch {
                    name: name.to_string(),
                    message: "command not found".to_string(),
                });
            }
            self.ledger.opened.lock().expect("opened lock").push(name.to_string());
            Ok(Box::new(FakeServer {
                name: name.to_string(),
                tools: config
                    .args
                    .iter()
                    .map(|tool| ToolDefinition {
                        name: tool.clone(),
                        description: String::new(),
                        parameters: json!({ "type": "object" }),
                    })
                    .collect(),
                ledger: Arc::clone(&self.ledger),
            }))
        }
    }

    fn server(tools: &[&str], timeout_secs: Option<u64>) -> ToolServerConfig {
        ToolServerConfig {
            command: "fake".to_string(),
            args: tools.iter().map(|tool| tool.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: None,
            timeout_secs,
        }
    }

    fn configs() -> BTreeMap<String, ToolServerConfig> {
        BTreeMap::from([
            ("alpha".to_string(), server(&["search", "fetch"], None)),
            ("beta".to_string(), server(&["slack_reply_to_thread", "search"], Some(5))),
            ("gamma".to_string(), server(&["notion"], None)),
        ])
    }

    #[tokio::test]
    async fn open_routes_calls_to_first_provider() {
        let ledger = Arc::new(Ledger::default());
        let connector = FakeConnector { ledger: Arc::clone(&ledger), failing: None };

        let group = ToolServerGroup::open(&connector, &configs(), Duration::from_secs(60))
            .await
            .expect("group should open");

        assert_eq!(group.len(), 3);
        let names: Vec<String> = group.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["search", "fetch", "slack_reply_to_thread", "notion"]);
        assert!(group.provides("notion"));
        assert!(!group.provides("clock"));

        let output = group.call("search", json!({ "q": "x" })).await.expect("call");
        assert_eq!(output, ToolOutput::Value(json!("alpha:search:{\"q\":\"x\"}")));
        assert!(matches!(
            group.call("clock", json!({})).await,
            Err(ToolServerError::UnknownTool(ref tool)) if tool == "clock"
        ));

        assert_eq!(
            ledger.timeouts.lock().expect("timeouts lock").as_slice(),
            &[("alpha".to_string(), 60), ("beta".to_string(), 5), ("gamma".to_string(), 60)]
        );

        group.close().await;
        assert_eq!(ledger.closed.lock().expect("closed lock").len(), 3);
    }

    #[tokio::test]
    async fn failed_open_closes_already_started_servers() {
        let ledger = Arc::new(Ledger::default());
        let connector = FakeConnector { ledger: Arc::clone(&ledger), failing: Some("beta") };

        let error = ToolServerGroup::open(&connector, &configs(), Duration::from_secs(60))
            .await
            .err()
            .expect("open must fail");

        assert!(error.to_string().contains("beta"));
        assert_eq!(ledger.opened.lock().expect("opened lock").as_slice(), &["alpha".to_string()]);
        assert_eq!(ledger.closed.lock().expect("closed lock").as_slice(), &["alpha".to_string()]);
    }

    #[test]
    fn listing_entries_become_definitions() {
        let definition = definition_from_listing(&json!({
            "name": "slack_reply_to_thread",
            "description": "Reply in a thread",
            "inputSchema": { "type": "object", "properties": { "text": { "type": "string" } } }
        }))
        .expect("definition");
        assert_eq!(definition.name, "slack_reply_to_thread");
        assert_eq!(definition.parameters["properties"]["text"]["type"], "string");

        let bare = definition_from_listing(&json!({ "name": "ping" })).expect("definition");
        assert_eq!(bare.parameters, json!({ "type": "object" }));
        assert!(definition_from_listing(&json!({ "name": "  " })).is_none());
    }

    #[test]
    fn call_results_are_flattened_to_text() {
        let ok = output_from_result(&json!({
            "content": [{ "type": "text", "text": "a" }, { "type": "image", "data": "..." }, { "type": "text", "text": "b" }],
            "isError": false
        }));
        assert_eq!(ok, ToolOutput::Value(json!("a\nb")));

        let failed = output_from_result(&json!({
            "content": [{ "type": "text", "text": "channel_not_found" }],
            "isError": true
        }));
        assert_eq!(failed, ToolOutput::Error("channel_not_found".to_string()));

        let structured = output_from_result(&json!({ "content": [], "structuredContent": { "ok": true } }));
        assert_eq!(structured, ToolOutput::Value(json!("{\"ok\":true}")));
    }
}
