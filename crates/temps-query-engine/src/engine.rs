use std::sync::Arc;
use tracing::{debug, info};

use crate::accessor::DataAccessor;
use crate::cache::{MemoryResultCache, ResultCache};
use crate::config::EngineConfig;
use crate::error::{CacheError, EngineError, ExecutionError, Result, ValidationResult};
use crate::executor::{ExecuteOptions, Executor, QueryResult};
use crate::optimizer::{OptimizedQuery, Optimizer};
use crate::query::Query;
use crate::registry::SchemaRegistry;
use crate::types::TenantContext;
use crate::validator::Validator;

/// Entry point tying validation, optimization and execution together.
///
/// Each call takes one schema snapshot from the registry, so a concurrent
/// re-registration never splits a query across two schema versions.
pub struct QueryEngine {
    registry: Arc<SchemaRegistry>,
    validator: Validator,
    optimizer: Optimizer,
    executor: Executor,
}

impl QueryEngine {
    /// Engine with an in-process result cache
    pub fn new(registry: Arc<SchemaRegistry>, config: EngineConfig) -> Self {
        let cache = MemoryResultCache::new(config.cache_max_entries, config.cache_ttl());
        Self::with_cache(registry, config, Arc::new(cache))
    }

    pub fn with_cache(
        registry: Arc<SchemaRegistry>,
        config: EngineConfig,
        cache: Arc<dyn ResultCache>,
    ) -> Self {
        info!(
            "Query engine ready (cache: {}, max_limit: {}, timeout: {}ms)",
            cache.backend(),
            config.max_limit,
            config.default_timeout_ms
        );

        Self {
            registry,
            validator: Validator::new(&config),
            optimizer: Optimizer::new(),
            executor: Executor::new(config, cache),
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        self.executor.config()
    }

    /// Check a query against its data source, reporting every problem
    pub async fn validate(&self, query: &Query) -> ValidationResult {
        let schema = self.registry.get_schema(&query.data_source_id).await.ok();
        self.validator.validate(query, schema.as_deref())
    }

    /// Validate, then rewrite a query for `tenant`
    pub async fn optimize(&self, query: &Query, tenant: &TenantContext) -> Result<OptimizedQuery> {
        let schema = self.registry.get_schema(&query.data_source_id).await.ok();

        let result = self.validator.validate(query, schema.as_deref());
        if !result.is_valid() {
            debug!(
                "Rejected query on {}: {} validation errors",
                query.data_source_id,
                result.errors().len()
            );
            return Err(EngineError::from(result));
        }

        match schema {
            Some(schema) => Ok(self.optimizer.optimize(query, &schema, tenant)),
            // Validation reports a missing source, so this is unreachable
            // unless the source vanished in between
            None => Err(ExecutionError::unavailable(format!(
                "Data source {} is not registered",
                query.data_source_id
            ))
            .into()),
        }
    }

    /// Validate, optimize and run a query for `tenant`
    pub async fn execute(
        &self,
        query: &Query,
        tenant: &TenantContext,
        options: &ExecuteOptions,
    ) -> Result<QueryResult> {
        let optimized = self.optimize(query, tenant).await?;
        let accessor = self.accessor(&query.data_source_id).await?;

        let result = self
            .executor
            .execute(&optimized, accessor, tenant, options)
            .await?;

        debug!(
            "Executed query on {} for tenant {}: {} rows in {}ms (cache hit: {})",
            query.data_source_id, tenant, result.row_count, result.execution_ms, result.cache_hit
        );
        Ok(result)
    }

    /// Drop cached results computed from a data source, e.g. after its data
    /// changed
    pub async fn invalidate_source(&self, data_source_id: &str) -> std::result::Result<(), CacheError> {
        info!("Invalidating cached results for data source {}", data_source_id);
        self.executor.invalidate_source(data_source_id).await
    }

    pub async fn invalidate_all(&self) -> std::result::Result<(), CacheError> {
        info!("Invalidating all cached query results");
        self.executor.invalidate_all().await
    }

    async fn accessor(&self, data_source_id: &str) -> Result<Arc<dyn DataAccessor>> {
        self.registry
            .get_accessor(data_source_id)
            .await
            .map_err(|e| ExecutionError::unavailable(e.to_string()).into())
    }
}
