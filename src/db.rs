use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use docflow_core::PipelineError;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Workers and the HTTP server share the file; writers wait on the
    // busy timeout instead of failing with SQLITE_BUSY.
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.db.busy_timeout_ms))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Store-side mapping of driver errors. Every database failure is worth a
/// retry from the worker's point of view.
pub fn store_error(e: sqlx::Error) -> PipelineError {
    PipelineError::TransientIo(format!("store: {}", e))
}

/// Queue-side mapping: contention and pool exhaustion mean the queue is
/// unavailable right now; anything else is a transient I/O failure.
pub fn queue_error(e: sqlx::Error) -> PipelineError {
    let busy = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6"))
                || db.message().contains("locked")
        }
        _ => false,
    };
    if busy {
        PipelineError::QueueUnavailable(e.to_string())
    } else {
        PipelineError::TransientIo(format!("queue: {}", e))
    }
}

/// Typed column read that reports decode failures instead of panicking.
pub fn col<'r, T>(row: &'r SqliteRow, name: &str) -> docflow_core::Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(store_error)
}

pub fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
