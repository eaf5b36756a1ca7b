//! Result cache keyed by tenant and canonical query.
//!
//! The key is a SHA-256 digest of a canonical JSON rendering of
//! `(tenant, query, limit, offset)`. AND/OR children, select items and
//! group-by fields are sorted first, so queries differing only in the
//! order of commutative parts share an entry. Order-by is kept as written.
//! The query's own `limit`/`offset` are dropped in favour of the effective
//! page window.
//!
//! Two stores are provided: [`MemoryResultCache`] backed by moka and
//! [`RedisResultCache`] for sharing results between engine instances.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::CacheError;
use crate::query::{Compound, FilterNode, LogicalOp, Query};
use crate::types::{Row, TenantContext};

/// Digest identifying one cached result
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    tenant: &'a str,
    query: &'a Query,
    limit: usize,
    offset: usize,
}

impl CacheKey {
    /// Derive the key for a tenant's page of an optimized query
    pub fn compute(
        tenant: &TenantContext,
        query: &Query,
        limit: usize,
        offset: usize,
    ) -> Result<Self, CacheError> {
        let canonical = canonicalize(query);
        let material = serde_json::to_vec(&KeyMaterial {
            tenant: tenant.tenant_id(),
            query: &canonical,
            limit,
            offset,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&material);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The same key tagged with an invalidation generation
    pub fn scoped(&self, generation: u64) -> Self {
        Self(format!("{}@{}", self.0, generation))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Copy of `query` with commutative parts in a fixed order
pub fn canonicalize(query: &Query) -> Query {
    let mut canonical = query.clone();
    canonical.filters = query.filters.as_ref().map(canonical_filter);
    canonical.select.sort_by_key(sort_key);
    canonical.select.dedup();
    canonical.group_by.sort();
    canonical.group_by.dedup();
    canonical.limit = None;
    canonical.offset = None;
    canonical
}

fn canonical_filter(node: &FilterNode) -> FilterNode {
    match node {
        FilterNode::Predicate(_) => node.clone(),
        FilterNode::Compound(c) => {
            let mut children: Vec<FilterNode> = c.children.iter().map(canonical_filter).collect();
            if c.op != LogicalOp::Not {
                children.sort_by_key(sort_key);
            }
            FilterNode::Compound(Compound { op: c.op, children })
        }
    }
}

fn sort_key<T: Serialize>(item: &T) -> String {
    serde_json::to_string(item).unwrap_or_default()
}

const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// A stored query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data_source_id: String,
    pub tenant_id: String,
    pub rows: Vec<Row>,
    pub truncated: bool,
    pub computed_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        data_source_id: impl Into<String>,
        tenant: &TenantContext,
        rows: Vec<Row>,
        truncated: bool,
        ttl: Duration,
    ) -> Self {
        Self {
            key,
            data_source_id: data_source_id.into(),
            tenant_id: tenant.tenant_id().to_string(),
            rows,
            truncated,
            computed_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.ttl_secs)
            .unwrap_or(MAX_TTL_SECS)
            .min(MAX_TTL_SECS);
        self.computed_at + ChronoDuration::seconds(secs)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// Store for computed results. Failures are reported, never fatal: the
/// executor treats an erroring cache as a miss.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Get the backend name of this cache
    fn backend(&self) -> &'static str;

    /// Look up a fresh entry
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store an entry; it expires after its own ttl
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Drop every entry computed from a data source
    async fn invalidate_source(&self, data_source_id: &str) -> Result<(), CacheError>;

    async fn invalidate_all(&self) -> Result<(), CacheError>;
}

/// In-process cache with a bounded entry count
pub struct MemoryResultCache {
    entries: Cache<CacheKey, Arc<CacheEntry>>,
}

impl MemoryResultCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { entries }
    }

    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        match self.entries.get(key).await {
            Some(entry) if entry.is_fresh(Utc::now()) => Ok(Some(entry.as_ref().clone())),
            Some(_) => {
                self.entries.invalidate(key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(entry.key.clone(), Arc::new(entry)).await;
        Ok(())
    }

    async fn invalidate_source(&self, data_source_id: &str) -> Result<(), CacheError> {
        let stale: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.data_source_id == data_source_id)
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        debug!(
            "Invalidating {} cached results for data source {}",
            stale.len(),
            data_source_id
        );

        for key in stale {
            self.entries.invalidate(&key).await;
        }
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<(), CacheError> {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        Ok(())
    }
}

const REDIS_PREFIX: &str = "temps:query";

/// Cache shared through Redis.
///
/// Entries are stored as JSON under `temps:query:result:<key>` with a
/// server-side expiry. A set per data source indexes its keys so a source
/// can be invalidated without scanning.
pub struct RedisResultCache {
    connection: ConnectionManager,
}

impl RedisResultCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    fn result_key(key: &CacheKey) -> String {
        format!("{}:result:{}", REDIS_PREFIX, key)
    }

    fn source_index_key(data_source_id: &str) -> String {
        format!("{}:source:{}", REDIS_PREFIX, data_source_id)
    }

    fn sources_key() -> String {
        format!("{}:sources", REDIS_PREFIX)
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(Self::result_key(key)).await?;

        match raw {
            Some(json) => {
                let entry: CacheEntry = serde_json::from_str(&json)?;
                Ok(entry.is_fresh(Utc::now()).then_some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        if entry.ttl_secs == 0 {
            return Ok(());
        }

        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&entry)?;
        let result_key = Self::result_key(&entry.key);
        let index_key = Self::source_index_key(&entry.data_source_id);

        let _: () = conn.set_ex(&result_key, json, entry.ttl_secs).await?;
        let _: () = conn.sadd(&index_key, &result_key).await?;
        let _: () = conn.sadd(Self::sources_key(), &entry.data_source_id).await?;
        Ok(())
    }

    async fn invalidate_source(&self, data_source_id: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let index_key = Self::source_index_key(data_source_id);
        let keys: Vec<String> = conn.smembers(&index_key).await?;

        debug!(
            "Invalidating {} cached results for data source {} in Redis",
            keys.len(),
            data_source_id
        );

        if !keys.is_empty() {
            let _: () = conn.del(&keys).await?;
        }
        let _: () = conn.del(&index_key).await?;
        let _: () = conn.srem(Self::sources_key(), data_source_id).await?;
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let sources: Vec<String> = conn.smembers(Self::sources_key()).await?;
        for source in sources {
            self.invalidate_source(&source).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::AggregateExpr;
    use crate::types::{AggregateFunction, Operator};
    use serde_json::json;

    fn tenant() -> TenantContext {
        TenantContext::new("t1")
    }

    fn entry(key: CacheKey, source: &str, ttl: Duration) -> CacheEntry {
        let row: Row = [("region".to_string(), json!("EU"))].into_iter().collect();
        CacheEntry::new(key, source, &tenant(), vec![row], false, ttl)
    }

    #[test]
    fn test_key_ignores_commutative_order() {
        let a = Query::new("orders")
            .select_field("region")
            .select_aggregate(AggregateExpr::new(AggregateFunction::Sum, "amount"))
            .group_by("region")
            .with_filters(FilterNode::and(vec![
                FilterNode::predicate("status", Operator::Eq, json!("OPEN")),
                FilterNode::predicate("region", Operator::Eq, json!("EU")),
            ]));
        let b = Query::new("orders")
            .select_aggregate(AggregateExpr::new(AggregateFunction::Sum, "amount"))
            .select_field("region")
            .group_by("region")
            .with_filters(FilterNode::and(vec![
                FilterNode::predicate("region", Operator::Eq, json!("EU")),
                FilterNode::predicate("status", Operator::Eq, json!("OPEN")),
            ]));

        assert_eq!(
            CacheKey::compute(&tenant(), &a, 10, 0).unwrap(),
            CacheKey::compute(&tenant(), &b, 10, 0).unwrap()
        );
    }

    #[test]
    fn test_key_depends_on_effective_window_only() {
        let query = Query::new("orders").select_field("region");
        let paged = query.clone().with_limit(50).with_offset(10);

        assert_eq!(
            CacheKey::compute(&tenant(), &query, 50, 10).unwrap(),
            CacheKey::compute(&tenant(), &paged, 50, 10).unwrap()
        );
    }

    #[test]
    fn test_key_separates_tenant_page_and_sort() {
        let query = Query::new("orders").select_field("region");
        let base = CacheKey::compute(&tenant(), &query, 10, 0).unwrap();

        assert_ne!(base, CacheKey::compute(&TenantContext::new("t2"), &query, 10, 0).unwrap());
        assert_ne!(base, CacheKey::compute(&tenant(), &query, 11, 0).unwrap());
        assert_ne!(base, CacheKey::compute(&tenant(), &query, 10, 5).unwrap());

        let asc = query.clone().order_by(crate::query::OrderBy::asc("region"));
        let desc = query.order_by(crate::query::OrderBy::desc("region"));
        assert_ne!(
            CacheKey::compute(&tenant(), &asc, 10, 0).unwrap(),
            CacheKey::compute(&tenant(), &desc, 10, 0).unwrap()
        );
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn test_entry_freshness() {
        let key = CacheKey::compute(&tenant(), &Query::new("orders"), 1, 0).unwrap();
        let e = entry(key, "orders", Duration::from_secs(60));
        assert!(e.is_fresh(e.computed_at));
        assert!(!e.is_fresh(e.computed_at + ChronoDuration::seconds(61)));
    }

    #[tokio::test]
    async fn test_memory_cache_put_get() {
        let cache = MemoryResultCache::new(100, Duration::from_secs(60));
        let key = CacheKey::compute(&tenant(), &Query::new("orders"), 1, 0).unwrap();

        assert!(cache.get(&key).await.unwrap().is_none());
        cache.put(entry(key.clone(), "orders", Duration::from_secs(60))).await.unwrap();

        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.rows.len(), 1);
        assert_eq!(hit.tenant_id, "t1");
    }

    #[tokio::test]
    async fn test_memory_cache_drops_stale_entries() {
        let cache = MemoryResultCache::new(100, Duration::from_secs(60));
        let key = CacheKey::compute(&tenant(), &Query::new("orders"), 1, 0).unwrap();
        cache.put(entry(key.clone(), "orders", Duration::ZERO)).await.unwrap();

        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_invalidation() {
        let cache = MemoryResultCache::new(100, Duration::from_secs(60));
        let orders = CacheKey::compute(&tenant(), &Query::new("orders"), 1, 0).unwrap();
        let events = CacheKey::compute(&tenant(), &Query::new("events"), 1, 0).unwrap();
        cache.put(entry(orders.clone(), "orders", Duration::from_secs(60))).await.unwrap();
        cache.put(entry(events.clone(), "events", Duration::from_secs(60))).await.unwrap();

        cache.invalidate_source("orders").await.unwrap();
        assert!(cache.get(&orders).await.unwrap().is_none());
        assert!(cache.get(&events).await.unwrap().is_some());

        cache.invalidate_all().await.unwrap();
        assert!(cache.get(&events).await.unwrap().is_none());
        assert_eq!(cache.entry_count().await, 0);
    }
}
