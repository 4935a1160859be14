use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::ConnectOptions;

/// Opens a fresh connection to the store file. The rollback journal keeps
/// every committed write inside the single database file, which is what the
/// blob mirror copies.
pub async fn connect_with_settings(
    path: &Path,
    busy_timeout_ms: u64,
) -> Result<SqliteConnection, sqlx::Error> {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(Duration::from_millis(busy_timeout_ms.max(1)))
        .connect()
        .await
}
