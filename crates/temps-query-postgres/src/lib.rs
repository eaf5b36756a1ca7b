//! PostgreSQL accessor for temps-query-engine
//!
//! Compiles optimized queries into parameterized SQL against one table and
//! converts result rows into engine rows.

pub mod sql;

use async_trait::async_trait;
use std::sync::Arc;
use temps_query_engine::{DataAccessor, DataSourceDescriptor, ExecutionError, FetchRequest, Row};
use tokio_postgres::error::SqlState;
use tokio_postgres::{CancelToken, Client, NoTls};
use tracing::{debug, error, warn};

pub use sql::{build_select, SelectStatement, SqlParam, TableRef};

/// Reads one PostgreSQL table as an engine data source
pub struct PostgresAccessor {
    client: Arc<Client>,
    table: TableRef,
    descriptor: Arc<DataSourceDescriptor>,
}

impl PostgresAccessor {
    /// Connect and read `table`, typed by `descriptor`
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
        table: TableRef,
        descriptor: DataSourceDescriptor,
    ) -> Result<Self, ExecutionError> {
        let config = format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, username, password, database
        );

        debug!(
            "Connecting to PostgreSQL: {}@{}:{}/{}",
            username, host, port, database
        );

        let (client, connection) = tokio_postgres::connect(&config, NoTls)
            .await
            .map_err(|e| ExecutionError::unavailable(format!("PostgreSQL connection failed: {}", e)))?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self::new(Arc::new(client), table, descriptor))
    }

    /// Use an existing client
    pub fn new(client: Arc<Client>, table: TableRef, descriptor: DataSourceDescriptor) -> Self {
        Self {
            client,
            table,
            descriptor: Arc::new(descriptor),
        }
    }

    pub fn descriptor(&self) -> &DataSourceDescriptor {
        &self.descriptor
    }
}

/// Cancels the running statement server-side if the fetch is dropped
/// before it finishes
struct CancelOnDrop {
    token: Option<CancelToken>,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = token.cancel_query(NoTls).await {
                    warn!("Failed to cancel abandoned PostgreSQL query: {}", e);
                }
            });
        }
    }
}

#[async_trait]
impl DataAccessor for PostgresAccessor {
    fn source_type(&self) -> &'static str {
        "postgres"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>, ExecutionError> {
        let statement = build_select(&self.table, &self.descriptor, request);
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            statement.params.iter().map(SqlParam::as_sql).collect();

        debug!("Executing query: {}", statement.sql);

        let guard = CancelOnDrop {
            token: Some(self.client.cancel_token()),
        };
        let result = self.client.query(&statement.sql, &params).await;
        guard.disarm();

        let rows = result.map_err(|e| {
            error!("PostgreSQL query failed: {}", e);
            error!("Failed SQL: {}", statement.sql);
            map_error(&e)
        })?;

        debug!("Query returned {} rows", rows.len());
        Ok(rows.iter().map(row_to_engine_row).collect())
    }
}

fn map_error(e: &tokio_postgres::Error) -> ExecutionError {
    if e.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) {
        return ExecutionError::permission_denied(e.to_string());
    }

    // Extract detailed error message from PostgreSQL error
    let message = match e.as_db_error() {
        Some(db_error) => {
            let mut msg = db_error.message().to_string();
            if let Some(detail) = db_error.detail() {
                msg.push_str(&format!("\nDetail: {}", detail));
            }
            if let Some(hint) = db_error.hint() {
                msg.push_str(&format!("\nHint: {}", hint));
            }
            msg
        }
        None => e.to_string(),
    };
    ExecutionError::unavailable(message)
}

/// Convert PostgreSQL row to engine row
fn row_to_engine_row(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| (column.name().to_string(), extract_value(row, idx)))
        .collect()
}

/// Extract value from PostgreSQL row
fn extract_value(row: &tokio_postgres::Row, idx: usize) -> serde_json::Value {
    use serde_json::Value;

    let type_name = row.columns()[idx].type_().name();

    match type_name {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),

        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),

        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),

        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map(Value::Number)
            .unwrap_or(Value::Null),

        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),

        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),

        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.and_utc().to_rfc3339()))
            .unwrap_or(Value::Null),

        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),

        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),

        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),

        // Text-like and unknown types
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
