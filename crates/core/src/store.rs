use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of one statement against the store. Failures are values, never
/// panics or transport errors, so tool callers can hand them to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows { columns: Vec<String>, rows: Vec<Vec<Value>> },
    Committed { rows_affected: u64 },
    Failed { message: String },
}

impl QueryOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed { message: message.into() }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Rows as a list of column-name keyed objects.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        match self {
            Self::Rows { columns, rows } => rows
                .iter()
                .map(|row| columns.iter().cloned().zip(row.iter().cloned()).collect())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Rows { .. } => {
                Value::Array(self.records().into_iter().map(Value::Object).collect())
            }
            Self::Committed { rows_affected } => {
                serde_json::json!({ "status": "success", "rows_affected": rows_affected })
            }
            Self::Failed { message } => {
                serde_json::json!({ "status": "error", "message": message })
            }
        }
    }
}

/// Shared access to the bot's SQLite store.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> QueryOutcome;

    /// `CREATE TABLE` statements of every table, newline separated. Failures
    /// come back as a `Schema fetch failed: ...` string.
    async fn schema(&self) -> String;

    /// Cheap liveness check used by the health endpoint.
    async fn ping(&self) -> Result<(), String> {
        match self.query("SELECT 1", &[]).await {
            QueryOutcome::Failed { message } => Err(message),
            _ => Ok(()),
        }
    }
}

/// A statement returns rows iff it starts with `select`, ignoring case and
/// leading whitespace. Anything else is executed and committed.
pub fn is_read_statement(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    trimmed.get(..6).is_some_and(|prefix| prefix.eq_ignore_ascii_case("select"))
}
