/// Relational data source
///
/// The conductor depends on one capability: run a read-only query and get a
/// tabular result back, or an execution error with its message. `SqliteSource`
/// provides it over a pooled SQLite connection opened read-only; every
/// statement also passes the read-only guard before execution.
///
/// The pool is shared by all sessions. No session holds a connection beyond a
/// single query execution.
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, ConnectOptions, Row, ValueRef};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;

pub mod guard;
pub mod table;

pub use guard::ensure_read_only;
pub use table::Table;

/// Errors produced while running a query
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// The statement was refused before execution
    #[error("query rejected: {0}")]
    Rejected(String),

    /// The database reported an error
    #[error("{0}")]
    Execution(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// Read-only relational data source
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Execute a read-only statement
    async fn query(&self, sql: &str) -> std::result::Result<Table, QueryError>;

    /// Schema description (DDL) used when prompting for queries
    async fn schema(&self) -> std::result::Result<String, QueryError>;

    /// Whether the source is reachable
    async fn ping(&self) -> bool {
        self.query("SELECT 1").await.is_ok()
    }
}

/// SQLite-backed data source
pub struct SqliteSource {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl SqliteSource {
    /// Open an existing database read-only
    ///
    /// The database file is never created; a missing file is an error.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        info!("Opening data source at: {}", config.path.display());

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .read_only(true)
            .create_if_missing(false)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", config.path.display()))?;

        debug!("Data source connection pool established");

        Ok(Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        })
    }

    /// Close all pooled connections
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DataSource for SqliteSource {
    async fn query(&self, sql: &str) -> std::result::Result<Table, QueryError> {
        let statement =
            ensure_read_only(sql).map_err(|e| QueryError::Rejected(e.to_string()))?;

        let rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(statement).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| QueryError::Timeout(self.query_timeout))?
        .map_err(|e| QueryError::Execution(execution_message(&e)))?;

        let table = rows_to_table(&rows);
        debug!(rows = table.len(), "Query executed");
        Ok(table)
    }

    async fn schema(&self) -> std::result::Result<String, QueryError> {
        let rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT sql FROM sqlite_master WHERE type IN ('table', 'view') AND sql IS NOT NULL ORDER BY name",
            )
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| QueryError::Timeout(self.query_timeout))?
        .map_err(|e| QueryError::Execution(execution_message(&e)))?;

        let statements: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .collect();

        Ok(statements.join(";\n"))
    }
}

/// Database error text without the sqlx wrapper noise
fn execution_message(error: &sqlx::Error) -> String {
    match error {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

fn rows_to_table(rows: &[SqliteRow]) -> Table {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| decode_cell(row, i)).collect())
        .collect();

    Table::new(columns, rows)
}

/// Decode one cell by its runtime storage class
fn decode_cell(row: &SqliteRow, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        Ok(_) => {}
    }

    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Value::String(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
        return Value::String(format!("<{} bytes>", v.len()));
    }
    Value::Null
}
