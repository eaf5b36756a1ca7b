//! # temps-query-engine
//!
//! Declarative analytical query engine behind Temps reporting.
//!
//! A caller describes *what* it wants as a [`Query`]: fields and aggregates
//! to select, a filter tree, grouping, ordering and a page window. The
//! engine then
//!
//! 1. **validates** the query against the data source's registered schema,
//!    collecting every problem instead of stopping at the first,
//! 2. **optimizes** it for the caller's tenant: the tenant predicate is
//!    injected, constants are folded, redundant filters removed and
//!    access-path predicates pushed first,
//! 3. **executes** it through the source's [`DataAccessor`], with result
//!    caching, collapsing of identical concurrent executions, a concurrency
//!    budget and a timeout.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use temps_query_engine::{
//!     AggregateExpr, AggregateFunction, DataSourceDescriptor, EngineConfig, ExecuteOptions,
//!     Field, FieldType, FilterNode, InMemoryAccessor, Operator, Query, QueryEngine,
//!     SchemaRegistry, TenantContext,
//! };
//!
//! # async fn example() -> temps_query_engine::Result<()> {
//! let registry = Arc::new(SchemaRegistry::new());
//! registry
//!     .register(
//!         DataSourceDescriptor::new("orders", "Orders")
//!             .with_field(Field::new("tenantId", FieldType::String))
//!             .with_field(Field::new("region", FieldType::String))
//!             .with_field(Field::new("status", FieldType::String))
//!             .with_field(Field::new("amount", FieldType::Number).aggregatable()),
//!         Arc::new(InMemoryAccessor::new(Vec::new())),
//!     )
//!     .await
//!     .expect("orders declares its tenant field");
//!
//! let engine = QueryEngine::new(registry, EngineConfig::default());
//!
//! let query = Query::new("orders")
//!     .select_field("region")
//!     .select_aggregate(AggregateExpr::new(AggregateFunction::Sum, "amount"))
//!     .group_by("region")
//!     .with_filters(FilterNode::predicate("status", Operator::Eq, "CLOSED".into()))
//!     .with_limit(50);
//!
//! let result = engine
//!     .execute(&query, &TenantContext::new("t1"), &ExecuteOptions::new())
//!     .await?;
//! println!("{} rows", result.row_count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Data sources
//!
//! A data source is a [`DataSourceDescriptor`] plus a [`DataAccessor`]
//! registered in the [`SchemaRegistry`]. Backend crates implement the
//! accessor:
//! - `temps-query-postgres` - PostgreSQL

pub mod accessor;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod executor;
pub mod flight;
pub mod optimizer;
pub mod query;
pub mod registry;
pub mod types;
pub mod validator;
pub mod value;

// Re-export commonly used items
pub use accessor::{DataAccessor, FetchRequest, InMemoryAccessor};
pub use cache::{CacheEntry, CacheKey, MemoryResultCache, RedisResultCache, ResultCache};
pub use config::{ConfigError, EngineConfig};
pub use engine::QueryEngine;
pub use error::{
    CacheError, EngineError, ExecutionError, ExecutionErrorKind, RegistryError, Result,
    ValidationError, ValidationErrorCode, ValidationResult,
};
pub use executor::{ExecuteOptions, Executor, QueryResult};
pub use optimizer::{OptimizedQuery, Optimizer, Rewrite};
pub use query::{
    AggregateExpr, Compound, FieldRef, FilterNode, LogicalOp, Operand, OrderBy, Predicate, Query,
    SelectItem, SortDirection,
};
pub use registry::SchemaRegistry;
pub use types::{
    AggregateFunction, DataSourceDescriptor, Field, FieldType, Operator, Row, TenantContext,
};
pub use validator::Validator;
pub use value::Collation;
