use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::llm::ToolDefinition;

/// JSON type of a tool argument or result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToolParameter {
    pub name: &'static str,
    pub kind: ValueKind,
    pub description: &'static str,
    pub required: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> Vec<ToolParameter> {
        Vec::new()
    }
    fn returns(&self) -> ValueKind;
    async fn execute(&self, input: Value) -> Result<Value>;

    fn definition(&self) -> ToolDefinition {
        let parameters = self.parameters();
        let properties: Map<String, Value> = parameters
            .iter()
            .map(|param| {
                (
                    param.name.to_string(),
                    json!({ "type": param.kind.as_str(), "description": param.description }),
                )
            })
            .collect();
        let required: Vec<&str> =
            parameters.iter().filter(|param| param.required).map(|param| param.name).collect();

        ToolDefinition {
            name: self.name().to_string(),
            description: format!("{} Returns {}.", self.description(), self.returns().as_str()),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// What a tool call hands back to the model.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutput {
    Value(Value),
    Error(String),
}

impl ToolOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn to_message_text(&self) -> String {
        match self {
            Self::Value(Value::String(text)) => text.clone(),
            Self::Value(value) => value.to_string(),
            Self::Error(message) => format!("Error: {message}"),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions sorted by name so the model sees a stable tool list.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> =
            self.tools.values().map(|tool| tool.definition()).collect();
        definitions.sort_by(|left, right| left.name.cmp(&right.name));
        definitions
    }

    /// Runs a tool. Every failure, including an unknown name or bad
    /// arguments, becomes `ToolOutput::Error`.
    pub async fn invoke(&self, name: &str, input: Value) -> ToolOutput {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutput::Error(format!("unknown tool `{name}`"));
        };

        let input = match input {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        if let Err(message) = check_arguments(&tool.parameters(), &input) {
            return ToolOutput::Error(message);
        }

        match tool.execute(input).await {
            Ok(value) => ToolOutput::Value(value),
            Err(error) => {
                tracing::warn!(
                    event_name = "agent.tool.failed",
                    tool = name,
                    error = %error,
                    "tool execution failed"
                );
                ToolOutput::Error(format!("{error:#}"))
            }
        }
    }
}

fn check_arguments(parameters: &[ToolParameter], input: &Value) -> Result<(), String> {
    let Some(arguments) = input.as_object() else {
        return Err("tool arguments must be a JSON object".to_string());
    };

    for param in parameters {
        match arguments.get(param.name) {
            None | Some(Value::Null) if param.required => {
                return Err(format!("missing required argument `{}`", param.name));
            }
            Some(value) if !value.is_null() && !param.kind.accepts(value) => {
                return Err(format!(
                    "argument `{}` must be of type {}",
                    param.name,
                    param.kind.as_str()
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{Tool, ToolOutput, ToolParameter, ToolRegistry, ValueKind};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the input."
        }

        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter {
                name: "text",
                kind: ValueKind::String,
                description: "text to echo",
                required: true,
            }]
        }

        fn returns(&self) -> ValueKind {
            ValueKind::String
        }

        async fn execute(&self, input: Value) -> Result<Value> {
            let text = input["text"].as_str().unwrap_or_default();
            if text == "boom" {
                bail!("echo exploded");
            }
            Ok(Value::String(text.to_string()))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool);
        registry
    }

    #[tokio::test]
    async fn invokes_registered_tool() {
        let output = registry().invoke("echo", json!({ "text": "hi" })).await;
        assert_eq!(output, ToolOutput::Value(json!("hi")));
        assert_eq!(output.to_message_text(), "hi");
    }

    #[tokio::test]
    async fn failures_become_error_outputs() {
        let registry = registry();

        let unknown = registry.invoke("nope", json!({})).await;
        assert_eq!(unknown, ToolOutput::Error("unknown tool `nope`".to_string()));

        let missing = registry.invoke("echo", Value::Null).await;
        assert_eq!(missing, ToolOutput::Error("missing required argument `text`".to_string()));

        let wrong_type = registry.invoke("echo", json!({ "text": 5 })).await;
        assert_eq!(
            wrong_type,
            ToolOutput::Error("argument `text` must be of type string".to_string())
        );

        let exploded = registry.invoke("echo", json!({ "text": "boom" })).await;
        assert!(exploded.is_error());
        assert_eq!(exploded.to_message_text(), "Error: echo exploded");
    }

    #[test]
    fn definition_declares_schema_and_return_type() {
        let definitions = registry().definitions();

        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "echo");
        assert_eq!(definitions[0].description, "Echo the input. Returns string.");
        assert_eq!(definitions[0].parameters["properties"]["text"]["type"], "string");
        assert_eq!(definitions[0].parameters["required"], json!(["text"]));
    }
}
