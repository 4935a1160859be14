use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mentionbot_core::config::{LlmConfig, LlmProvider};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self { role: role.to_string(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self { role: "assistant".to_string(), content: None, tool_calls: Some(calls), tool_call_id: None }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn requested_tools(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall { name: name.into(), arguments: arguments.to_string() },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the model produced it.
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// A callable advertised to the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Result<ChatMessage>;
}

enum Credential {
    Bearer(SecretString),
    ApiKey(SecretString),
}

/// Chat Completions client for OpenAI and Azure OpenAI deployments.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    url: String,
    model: String,
    credential: Credential,
    max_retries: u32,
}

impl OpenAiChatClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config.api_key.clone().context("LLM api key is not configured")?;
        let (url, credential) = match config.provider {
            LlmProvider::OpenAi => {
                (openai_url(&config.base_url), Credential::Bearer(api_key))
            }
            LlmProvider::Azure => {
                let endpoint =
                    config.azure.endpoint.as_deref().context("AZURE_OPENAI_ENDPOINT is not set")?;
                let deployment = config
                    .azure
                    .deployment
                    .as_deref()
                    .context("AZURE_OPENAI_DEPLOYMENT is not set")?;
                let api_version = config
                    .azure
                    .api_version
                    .as_deref()
                    .context("AZURE_OPENAI_API_VERSION is not set")?;
                (azure_url(endpoint, deployment, api_version), Credential::ApiKey(api_key))
            }
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { http, url, model: config.model.clone(), credential, max_retries: config.max_retries })
    }

    async fn send_once(&self, body: &Value) -> Result<Result<Value, (StatusCode, String)>> {
        let request = self.http.post(&self.url).json(body);
        let request = match &self.credential {
            Credential::Bearer(key) => request.bearer_auth(key.expose_secret()),
            Credential::ApiKey(key) => request.header("api-key", key.expose_secret()),
        };

        let response = request.send().await.context("failed to send LLM request")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(Err((status, text)));
        }

        let payload = response.json::<Value>().await.context("failed to parse LLM response")?;
        Ok(Ok(payload))
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Result<ChatMessage> {
        let body = request_body(&self.model, messages, tools);
        let mut attempt = 0u32;

        loop {
            let outcome = self.send_once(&body).await;
            let retryable = match &outcome {
                Ok(Ok(_)) => false,
                Ok(Err((status, _))) => is_retryable(*status),
                Err(_) => true,
            };

            if retryable && attempt < self.max_retries {
                let delay = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)));
                tracing::warn!(
                    event_name = "agent.llm.retry",
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying chat completion"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return match outcome? {
                Ok(payload) => parse_completion(&payload),
                Err((status, text)) => bail!("LLM API error {status}: {text}"),
            };
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn openai_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

fn azure_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{deployment}/chat/completions?api-version={api_version}",
        endpoint.trim_end_matches('/')
    )
}

pub(crate) fn request_body(model: &str, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages,
    });

    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.iter().map(ToolDefinition::to_openai).collect());
    }

    body
}

pub(crate) fn parse_completion(payload: &Value) -> Result<ChatMessage> {
    let message = payload["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .map(|choice| &choice["message"])
        .context("empty choices in LLM response")?;

    let content = message["content"].as_str().map(String::from);
    let tool_calls = match message.get("tool_calls") {
        Some(Value::Null) | None => None,
        Some(calls) => Some(
            serde_json::from_value::<Vec<ToolCall>>(calls.clone())
                .context("malformed tool_calls in LLM response")?,
        ),
    }
    .filter(|calls| !calls.is_empty());

    Ok(ChatMessage { role: "assistant".to_string(), content, tool_calls, tool_call_id: None })
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        azure_url, is_retryable, openai_url, parse_completion, request_body, ChatMessage,
        ToolCall, ToolDefinition,
    };

    #[test]
    fn provider_urls_are_built_from_configuration() {
        assert_eq!(openai_url("https://api.openai.com/v1/"), "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            azure_url("https://res.openai.azure.com/", "gpt-4o", "2024-06-01"),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn tools_are_only_sent_when_present() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let body = request_body("gpt-4o-mini", &messages, &[]);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][1], json!({ "role": "user", "content": "hi" }));

        let tools = vec![ToolDefinition {
            name: "clock".to_string(),
            description: "current time".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        }];
        let body = request_body("gpt-4o-mini", &messages, &tools);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "clock");
    }

    #[test]
    fn tool_call_messages_serialize_in_wire_format() {
        let call = ToolCall::function("call_1", "get_str_length", json!({ "text": "abc" }));
        let message = ChatMessage::assistant_tool_calls(vec![call]);
        let wire = serde_json::to_value(&message).expect("serialize");

        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"text\":\"abc\"}");
        assert_eq!(wire["content"], json!(null));

        let reply = serde_json::to_value(ChatMessage::tool("call_1", "3")).expect("serialize");
        assert_eq!(reply["tool_call_id"], "call_1");
    }

    #[test]
    fn completion_with_tool_calls_is_parsed() {
        let payload = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "clock", "arguments": "{}" }
                    }]
                }
            }]
        });

        let message = parse_completion(&payload).expect("parse");
        assert_eq!(message.requested_tools().len(), 1);
        assert_eq!(message.requested_tools()[0].function.name, "clock");
        assert_eq!(message.content, None);
    }

    #[test]
    fn empty_tool_call_list_is_treated_as_final_answer() {
        let payload = json!({
            "choices": [{ "message": { "role": "assistant", "content": "done", "tool_calls": [] } }]
        });

        let message = parse_completion(&payload).expect("parse");
        assert!(message.requested_tools().is_empty());
        assert_eq!(message.content.as_deref(), Some("done"));
    }

    #[test]
    fn missing_choices_is_an_error() {
        assert!(parse_completion(&json!({ "choices": [] })).is_err());
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }
}
