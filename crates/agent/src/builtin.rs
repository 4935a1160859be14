//! Tools compiled into the bot: clock, string length, log readers and the
//! two store tools.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mentionbot_core::config::LoggingConfig;
use mentionbot_core::store::DataStore;
use serde_json::Value;

use crate::tools::{Tool, ToolParameter, ToolRegistry, ValueKind};

pub fn builtin_registry(store: Arc<dyn DataStore>, logging: &LoggingConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(ClockTool);
    registry.register(StringLengthTool);
    registry.register(LogReaderTool::new(
        "read_stdout",
        "Read the bot's captured stdout log.",
        logging.stdout_log_path(),
    ));
    registry.register(LogReaderTool::new(
        "read_stderr",
        "Read the bot's captured stderr log.",
        logging.stderr_log_path(),
    ));
    registry.register(LogReaderTool::new(
        "agent_log_reader",
        "Read the bot's application log.",
        logging.app_log_path(),
    ));
    registry.register(StoreQueryTool::new(Arc::clone(&store)));
    registry.register(StoreSchemaTool::new(store));
    registry
}

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &'static str {
        "clock"
    }

    fn description(&self) -> &'static str {
        "Current local date and time as `YYYY-MM-DD HH:MM:SS`."
    }

    fn returns(&self) -> ValueKind {
        ValueKind::String
    }

    async fn execute(&self, _input: Value) -> Result<Value> {
        Ok(Value::String(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()))
    }
}

pub struct StringLengthTool;

#[async_trait]
impl Tool for StringLengthTool {
    fn name(&self) -> &'static str {
        "get_str_length"
    }

    fn description(&self) -> &'static str {
        "Count the characters in a string."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter {
            name: "text",
            kind: ValueKind::String,
            description: "text to measure",
            required: true,
        }]
    }

    fn returns(&self) -> ValueKind {
        ValueKind::Integer
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let text = input["text"].as_str().context("`text` must be a string")?;
        Ok(Value::from(text.chars().count()))
    }
}

pub struct LogReaderTool {
    name: &'static str,
    description: &'static str,
    path: PathBuf,
}

impl LogReaderTool {
    pub fn new(name: &'static str, description: &'static str, path: PathBuf) -> Self {
        Self { name, description, path }
    }
}

#[async_trait]
impl Tool for LogReaderTool {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn returns(&self) -> ValueKind {
        ValueKind::String
    }

    async fn execute(&self, _input: Value) -> Result<Value> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Value::String(contents)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                bail!("log file `{}` does not exist", self.path.display())
            }
            Err(error) => Err(error)
                .with_context(|| format!("failed to read log file `{}`", self.path.display())),
        }
    }
}

pub struct StoreQueryTool {
    store: Arc<dyn DataStore>,
}

impl StoreQueryTool {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for StoreQueryTool {
    fn name(&self) -> &'static str {
        "db_query"
    }

    fn description(&self) -> &'static str {
        "Run one SQL statement against the bot's SQLite database. SELECT statements \
         return rows as objects; anything else is committed and returns the affected row count."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter {
                name: "sql",
                kind: ValueKind::String,
                description: "SQL statement with `?` placeholders",
                required: true,
            },
            ToolParameter {
                name: "params",
                kind: ValueKind::Array,
                description: "positional values bound to the placeholders",
                required: false,
            },
        ]
    }

    fn returns(&self) -> ValueKind {
        ValueKind::Object
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let sql = input["sql"].as_str().context("`sql` must be a string")?;
        let params = input["params"].as_array().cloned().unwrap_or_default();
        Ok(self.store.query(sql, &params).await.to_json())
    }
}

pub struct StoreSchemaTool {
    store: Arc<dyn DataStore>,
}

impl StoreSchemaTool {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for StoreSchemaTool {
    fn name(&self) -> &'static str {
        "db_schema"
    }

    fn description(&self) -> &'static str {
        "CREATE TABLE statements of every table in the bot's database."
    }

    fn returns(&self) -> ValueKind {
        ValueKind::String
    }

    async fn execute(&self, _input: Value) -> Result<Value> {
        Ok(Value::String(self.store.schema().await))
    }
}
