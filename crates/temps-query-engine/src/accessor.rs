use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ExecutionError;
use crate::eval;
use crate::query::Query;
use crate::types::{DataSourceDescriptor, Row, TenantContext};

/// Physical read handed to a data source
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Optimized query; its filter already carries the tenant predicate
    pub query: Query,
    /// Columns the result rows must carry; anything else is dropped
    pub projection: Vec<String>,
    /// Maximum rows to return. The executor asks for one row more than the
    /// caller's page so truncation can be detected.
    pub limit: usize,
    pub offset: usize,
    pub tenant: TenantContext,
    /// Schema snapshot the query was optimized against
    pub source: Arc<DataSourceDescriptor>,
}

/// Capability interface implemented once per concrete data source.
///
/// Implementations must honour the request's filter, grouping, ordering and
/// page window, and must stop work when the returned future is dropped.
#[async_trait]
pub trait DataAccessor: Send + Sync {
    /// Get the type name of this accessor
    fn source_type(&self) -> &'static str;

    /// Perform the read
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>, ExecutionError>;
}

/// Accessor over rows held in memory, evaluated with the reference evaluator
pub struct InMemoryAccessor {
    rows: Arc<RwLock<Vec<Row>>>,
}

impl InMemoryAccessor {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: Arc::new(RwLock::new(rows)),
        }
    }

    /// Replace the backing rows
    pub async fn replace_rows(&self, rows: Vec<Row>) {
        *self.rows.write().await = rows;
    }

    pub async fn push_row(&self, row: Row) {
        self.rows.write().await.push(row);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl DataAccessor for InMemoryAccessor {
    fn source_type(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>, ExecutionError> {
        let rows = self.rows.read().await;

        debug!(
            "Evaluating query on {} in-memory rows for tenant {}",
            rows.len(),
            request.tenant
        );

        let result = eval::run_page(
            &request.query,
            &request.source,
            &rows,
            Some(request.limit),
            request.offset,
        );
        Ok(result
            .into_iter()
            .map(|row| retain_columns(row, &request.projection))
            .collect())
    }
}

/// Drop every column not named in `projection`
pub fn retain_columns(mut row: Row, projection: &[String]) -> Row {
    row.retain(|column, _| projection.iter().any(|p| p == column));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FilterNode;
    use crate::types::{Field, FieldType, Operator};
    use serde_json::json;

    fn row(tenant: &str, region: &str) -> Row {
        [
            ("tenantId".to_string(), json!(tenant)),
            ("region".to_string(), json!(region)),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_in_memory_fetch_applies_window_and_projection() {
        let accessor = InMemoryAccessor::new(vec![
            row("t1", "EU"),
            row("t2", "US"),
            row("t1", "APAC"),
            row("t1", "US"),
        ]);

        let request = FetchRequest {
            query: Query::new("orders")
                .select_field("region")
                .select_field("tenantId")
                .with_filters(FilterNode::predicate("tenantId", Operator::Eq, json!("t1"))),
            projection: vec!["region".to_string()],
            limit: 2,
            offset: 1,
            tenant: TenantContext::new("t1"),
            source: Arc::new(
                DataSourceDescriptor::new("orders", "Orders")
                    .with_field(Field::new("tenantId", FieldType::String))
                    .with_field(Field::new("region", FieldType::String)),
            ),
        };

        let rows = accessor.fetch(&request).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["region"], json!("APAC"));
        assert!(rows.iter().all(|r| !r.contains_key("tenantId")));
    }

    #[tokio::test]
    async fn test_replace_rows() {
        let accessor = InMemoryAccessor::new(Vec::new());
        assert!(accessor.is_empty().await);
        accessor.replace_rows(vec![row("t1", "EU")]).await;
        accessor.push_row(row("t1", "US")).await;
        assert_eq!(accessor.len().await, 2);
    }
}
