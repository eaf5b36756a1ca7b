//! Bounded execution of optimized queries.
//!
//! Every execution resolves its page window, consults the result cache,
//! and otherwise fetches through the data source's accessor. Identical
//! concurrent executions share a single fetch. Each caller is bounded by its
//! own timeout, and the fetch itself by the timeout of the caller that
//! started it; a fetch nobody waits for any more is dropped.
//!
//! Invalidating a data source bumps its generation. A fetch keyed under an
//! older generation is neither joined by later callers nor stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use crate::accessor::{retain_columns, DataAccessor, FetchRequest};
use crate::cache::{CacheEntry, CacheKey, MemoryResultCache, ResultCache};
use crate::config::EngineConfig;
use crate::error::{CacheError, ExecutionError};
use crate::eval;
use crate::flight::{Role, SingleFlight};
use crate::optimizer::OptimizedQuery;
use crate::query::Query;
use crate::types::{Row, TenantContext};

fn default_cache() -> bool {
    true
}

/// Per-call execution overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    /// Read and write the result cache
    #[serde(default = "default_cache")]
    pub cache: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            limit: None,
            offset: None,
            cache: default_cache(),
            timeout_ms: None,
        }
    }
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = false;
        self
    }
}

/// Rows returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// The source had more matching rows than the page holds
    pub truncated: bool,
    pub execution_ms: u64,
    pub cache_hit: bool,
    pub columns: Vec<String>,
}

#[derive(Debug)]
struct Page {
    rows: Vec<Row>,
    truncated: bool,
}

type Outcome = Result<Arc<Page>, ExecutionError>;

/// Invalidation counters per data source
#[derive(Debug, Default)]
struct Generations {
    counter: u64,
    all: u64,
    sources: HashMap<String, u64>,
}

impl Generations {
    fn current(&self, data_source_id: &str) -> u64 {
        self.sources
            .get(data_source_id)
            .copied()
            .unwrap_or(0)
            .max(self.all)
    }

    fn bump(&mut self, data_source_id: &str) {
        self.counter += 1;
        self.sources.insert(data_source_id.to_string(), self.counter);
    }

    fn bump_all(&mut self) {
        self.counter += 1;
        self.all = self.counter;
        self.sources.clear();
    }
}

/// Where and under which generation a fetched page is cached
struct Store {
    cache: Arc<dyn ResultCache>,
    key: CacheKey,
    ttl: Duration,
    generations: Arc<RwLock<Generations>>,
    generation: u64,
}

impl Store {
    async fn put(self, request: &FetchRequest, rows: Vec<Row>, truncated: bool) {
        if self.ttl.is_zero() {
            return;
        }

        // Held across the write so an invalidation cannot slip in between
        let generations = self.generations.read().await;
        let data_source_id = &request.query.data_source_id;
        if generations.current(data_source_id) != self.generation {
            debug!(
                "Data source {} was invalidated during the fetch, result not cached",
                data_source_id
            );
            return;
        }

        let entry = CacheEntry::new(
            self.key,
            data_source_id.clone(),
            &request.tenant,
            rows,
            truncated,
            self.ttl,
        );
        if let Err(e) = self.cache.put(entry).await {
            warn!("Result cache ({}) write failed: {}", self.cache.backend(), e);
        }
    }
}

pub struct Executor {
    config: EngineConfig,
    cache: Arc<dyn ResultCache>,
    flights: SingleFlight<Outcome>,
    permits: Arc<Semaphore>,
    generations: Arc<RwLock<Generations>>,
}

impl Executor {
    pub fn new(config: EngineConfig, cache: Arc<dyn ResultCache>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_executions.max(1)));
        Self {
            config,
            cache,
            flights: SingleFlight::new(),
            permits,
            generations: Arc::new(RwLock::new(Generations::default())),
        }
    }

    /// Executor with an in-process cache sized from the configuration
    pub fn with_memory_cache(config: EngineConfig) -> Self {
        let cache = MemoryResultCache::new(config.cache_max_entries, config.cache_ttl());
        Self::new(config, Arc::new(cache))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Effective `(limit, offset)`: options, then query, then defaults,
    /// clamped to the configured bounds
    pub fn page_window(&self, query: &Query, options: &ExecuteOptions) -> (usize, usize) {
        let default_limit = i64::try_from(self.config.default_limit).unwrap_or(i64::MAX);
        let limit = options.limit.or(query.limit).unwrap_or(default_limit);
        let limit = u64::try_from(limit)
            .unwrap_or(0)
            .clamp(1, self.config.max_limit.max(1));

        let offset = options.offset.or(query.offset).unwrap_or(0);
        let offset = u64::try_from(offset)
            .unwrap_or(0)
            .min(self.config.max_offset);

        (
            usize::try_from(limit).unwrap_or(usize::MAX),
            usize::try_from(offset).unwrap_or(usize::MAX),
        )
    }

    /// Run an optimized query on behalf of `tenant`
    pub async fn execute(
        &self,
        optimized: &OptimizedQuery,
        accessor: Arc<dyn DataAccessor>,
        tenant: &TenantContext,
        options: &ExecuteOptions,
    ) -> Result<QueryResult, ExecutionError> {
        let started = Instant::now();
        let (limit, offset) = self.page_window(&optimized.query, options);
        let columns = optimized.projection.clone();

        if optimized.statically_empty {
            // Only a global aggregate produces a row over no input
            let rows = eval::run_page(&optimized.query, &optimized.source, &[], Some(limit), offset)
                .into_iter()
                .map(|row| retain_columns(row, &columns))
                .collect();
            return Ok(finish(rows, false, false, columns, started));
        }

        let key = match CacheKey::compute(tenant, &optimized.query, limit, offset) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Failed to derive cache key, executing without cache: {}", e);
                None
            }
        };

        let generation = self
            .generations
            .read()
            .await
            .current(optimized.data_source_id());

        if let (true, Some(key)) = (options.cache, &key) {
            match self.cache.get(key).await {
                Ok(Some(entry)) => {
                    debug!(
                        "Cache hit for query on {} (tenant {})",
                        optimized.data_source_id(),
                        tenant
                    );
                    return Ok(finish(entry.rows, entry.truncated, true, columns, started));
                }
                Ok(None) => debug!("Cache miss for query on {}", optimized.data_source_id()),
                Err(e) => warn!(
                    "Result cache ({}) read failed, executing without cache: {}",
                    self.cache.backend(),
                    e
                ),
            }
        }

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);

        let request = FetchRequest {
            query: optimized.query.clone(),
            projection: columns.clone(),
            limit: limit.saturating_add(1),
            offset,
            tenant: tenant.clone(),
            source: optimized.source.clone(),
        };
        let store = match (options.cache, &key) {
            (true, Some(key)) => Some(Store {
                cache: self.cache.clone(),
                key: key.clone(),
                ttl: self.config.cache_ttl(),
                generations: self.generations.clone(),
                generation,
            }),
            _ => None,
        };
        let work = fetch_page(
            accessor,
            request,
            limit,
            self.permits.clone(),
            timeout,
            store,
        );

        let shared = async {
            match &key {
                Some(key) => {
                    let flight_key = key.scoped(generation);
                    let (outcome, role) = self.flights.run(&flight_key, || work).await;
                    if role == Role::Follower {
                        debug!(
                            "Joined in-flight execution on {} for tenant {}",
                            optimized.data_source_id(),
                            tenant
                        );
                    }
                    outcome
                }
                None => work.await,
            }
        };

        let page = match tokio::time::timeout(timeout, shared).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!(
                    "Query on {} timed out after {}ms",
                    optimized.data_source_id(),
                    timeout_ms
                );
                return Err(ExecutionError::Timeout(timeout_ms));
            }
        };

        Ok(finish(
            page.rows.clone(),
            page.truncated,
            false,
            columns,
            started,
        ))
    }

    /// Drop cached pages of a data source. Fetches already running for it
    /// still answer their callers but are not cached.
    pub async fn invalidate_source(&self, data_source_id: &str) -> Result<(), CacheError> {
        let mut generations = self.generations.write().await;
        generations.bump(data_source_id);
        self.cache.invalidate_source(data_source_id).await
    }

    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        let mut generations = self.generations.write().await;
        generations.bump_all();
        self.cache.invalidate_all().await
    }
}

/// One fetch for one cache key: wait for a permit, read `limit + 1` rows,
/// trim to the page and store it
async fn fetch_page(
    accessor: Arc<dyn DataAccessor>,
    request: FetchRequest,
    limit: usize,
    permits: Arc<Semaphore>,
    timeout: Duration,
    store: Option<Store>,
) -> Outcome {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

    let fetched = tokio::time::timeout(timeout, async {
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::unavailable("executor is shutting down"))?;
        accessor.fetch(&request).await
    })
    .await
    .map_err(|_| ExecutionError::Timeout(timeout_ms))??;

    let truncated = fetched.len() > limit;
    let rows: Vec<Row> = fetched
        .into_iter()
        .take(limit)
        .map(|row| retain_columns(row, &request.projection))
        .collect();

    debug!(
        "Fetched {} rows from {} accessor for {}",
        rows.len(),
        accessor.source_type(),
        request.query.data_source_id
    );

    if let Some(store) = store {
        store.put(&request, rows.clone(), truncated).await;
    }

    Ok(Arc::new(Page { rows, truncated }))
}

fn finish(
    rows: Vec<Row>,
    truncated: bool,
    cache_hit: bool,
    columns: Vec<String>,
    started: Instant,
) -> QueryResult {
    QueryResult {
        row_count: rows.len(),
        rows,
        truncated,
        execution_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        cache_hit,
        columns,
    }
}
