use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::accessor::DataAccessor;
use crate::error::RegistryError;
use crate::types::DataSourceDescriptor;

/// A registered data source: its schema plus the accessor that reads it
#[derive(Clone)]
struct RegisteredSource {
    descriptor: Arc<DataSourceDescriptor>,
    accessor: Arc<dyn DataAccessor>,
}

/// Registry of queryable data sources.
///
/// The engine only reads from it. Registration is driven by the external
/// discovery/admin collaborator; descriptors are handed out as `Arc`
/// snapshots so a re-registration never changes a schema mid-query.
pub struct SchemaRegistry {
    sources: Arc<RwLock<HashMap<String, RegisteredSource>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            sources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a data source together with its accessor.
    ///
    /// The descriptor must declare its tenant field, since every query is
    /// filtered on it.
    pub async fn register(
        &self,
        descriptor: DataSourceDescriptor,
        accessor: Arc<dyn DataAccessor>,
    ) -> Result<(), RegistryError> {
        if descriptor.field(&descriptor.tenant_field).is_none() {
            warn!(
                "Rejected data source {}: tenant field '{}' is not declared",
                descriptor.id, descriptor.tenant_field
            );
            return Err(RegistryError::InvalidDescriptor(format!(
                "tenant field '{}' is not a declared field of '{}'",
                descriptor.tenant_field, descriptor.id
            )));
        }

        let id = descriptor.id.clone();
        let mut sources = self.sources.write().await;

        if sources.contains_key(&id) {
            warn!("Overwriting existing data source registration: {}", id);
        }

        debug!(
            "Registered data source {} ({} fields, accessor: {})",
            id,
            descriptor.fields.len(),
            accessor.source_type()
        );

        sources.insert(
            id,
            RegisteredSource {
                descriptor: Arc::new(descriptor),
                accessor,
            },
        );
        Ok(())
    }

    /// Remove a data source
    pub async fn deregister(&self, id: &str) -> bool {
        let removed = self.sources.write().await.remove(id).is_some();
        if removed {
            debug!("Deregistered data source: {}", id);
        }
        removed
    }

    /// Get the schema of a data source
    pub async fn get_schema(&self, id: &str) -> Result<Arc<DataSourceDescriptor>, RegistryError> {
        let sources = self.sources.read().await;
        sources
            .get(id)
            .map(|s| s.descriptor.clone())
            .ok_or_else(|| RegistryError::not_found(id))
    }

    /// Get the accessor reading a data source
    pub async fn get_accessor(&self, id: &str) -> Result<Arc<dyn DataAccessor>, RegistryError> {
        let sources = self.sources.read().await;
        sources
            .get(id)
            .map(|s| s.accessor.clone())
            .ok_or_else(|| RegistryError::not_found(id))
    }

    /// List registered data source ids, sorted
    pub async fn list_sources(&self) -> Vec<String> {
        let sources = self.sources.read().await;
        let mut ids: Vec<String> = sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn has_source(&self, id: &str) -> bool {
        self.sources.read().await.contains_key(id)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
