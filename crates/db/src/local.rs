use std::path::{Path, PathBuf};

use mentionbot_core::store::{is_read_statement, QueryOutcome};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Column, Connection, Row, TypeInfo, ValueRef};

use crate::connection::connect_with_settings;

/// The on-disk SQLite file. Every call opens its own connection and closes it
/// before returning, so nothing keeps the file open between statements.
#[derive(Clone, Debug)]
pub struct LocalStore {
    path: PathBuf,
    busy_timeout_ms: u64,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout_ms: u64) -> Self {
        Self { path: path.into(), busy_timeout_ms }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_parent_dir(&self) -> std::io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent).await
            }
            _ => Ok(()),
        }
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryOutcome, sqlx::Error> {
        self.ensure_parent_dir().await?;
        let mut conn = connect_with_settings(&self.path, self.busy_timeout_ms).await?;

        let query = params.iter().fold(sqlx::query(sql), bind_json);
        let outcome = if is_read_statement(sql) {
            let rows = query.fetch_all(&mut conn).await;
            rows.map(|rows| {
                let columns = rows
                    .first()
                    .map(|row| row.columns().iter().map(|column| column.name().to_string()).collect())
                    .unwrap_or_default();
                QueryOutcome::Rows { columns, rows: rows.iter().map(row_values).collect() }
            })
        } else {
            query
                .execute(&mut conn)
                .await
                .map(|result| QueryOutcome::Committed { rows_affected: result.rows_affected() })
        };

        if let Err(error) = conn.close().await {
            tracing::debug!(
                event_name = "store.connection.close_failed",
                error = %error,
                "sqlite connection did not close cleanly"
            );
        }

        outcome
    }

    pub async fn table_definitions(&self) -> Result<String, sqlx::Error> {
        self.ensure_parent_dir().await?;
        let mut conn = connect_with_settings(&self.path, self.busy_timeout_ms).await?;

        let rows: Vec<(Option<String>,)> =
            sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&mut conn)
                .await?;
        let _ = conn.close().await;

        Ok(rows.into_iter().filter_map(|(sql,)| sql).collect::<Vec<_>>().join("\n"))
    }
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => query.bind(integer),
            None => query.bind(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => query.bind(text.clone()),
        other => query.bind(other.to_string()),
    }
}

fn row_values(row: &SqliteRow) -> Vec<Value> {
    (0..row.len()).map(|index| column_value(row, index)).collect()
}

fn column_value(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
        Err(_) => return Value::Null,
    };

    match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => {
            row.try_get_unchecked::<i64, _>(index).map(Value::from).unwrap_or(Value::Null)
        }
        "REAL" => row.try_get_unchecked::<f64, _>(index).map(Value::from).unwrap_or(Value::Null),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|bytes| Value::String(hex(&bytes)))
            .unwrap_or(Value::Null),
        _ => row
            .try_get_unchecked::<String, _>(index)
            .map(Value::String)
            .or_else(|_| {
                row.try_get_unchecked::<Vec<u8>, _>(index).map(|bytes| Value::String(hex(&bytes)))
            })
            .unwrap_or(Value::Null),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
