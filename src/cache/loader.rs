use crate::cache::{CacheError, InstanceMetadata};
use crate::decode::read_header;
use crate::query::QueryProvider;
use crate::storage::StorageRouter;
use async_trait::async_trait;
use std::sync::Arc;

/// Loads instance metadata on a cache miss
#[async_trait]
pub trait MetadataLoader: Send + Sync {
    async fn load(&self, sop_instance_uid: &str) -> Result<InstanceMetadata, CacheError>;
}

/// Finds an instance through a query provider and reads its header from storage
pub struct IndexedMetadataLoader {
    query: Arc<dyn QueryProvider>,
    storage: Arc<StorageRouter>,
}

impl IndexedMetadataLoader {
    pub fn new(query: Arc<dyn QueryProvider>, storage: Arc<StorageRouter>) -> Self {
        Self { query, storage }
    }
}

#[async_trait]
impl MetadataLoader for IndexedMetadataLoader {
    async fn load(&self, sop_instance_uid: &str) -> Result<InstanceMetadata, CacheError> {
        let results = self
            .query
            .query(&format!("SOPInstanceUID:{}", sop_instance_uid))
            .await
            .map_err(|e| CacheError::Query(e.to_string()))?;

        // First hit wins when several locations hold the same instance
        let location = results
            .into_iter()
            .next()
            .map(|hit| hit.location)
            .ok_or_else(|| CacheError::NotFound(sop_instance_uid.to_string()))?;

        let item = self
            .storage
            .get(&location)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?
            .ok_or_else(|| CacheError::Storage(format!("nothing stored at {}", location)))?;

        let header = tokio::task::spawn_blocking(move || {
            let reader = item.open().map_err(|e| CacheError::Storage(e.to_string()))?;
            read_header(reader).map_err(|e| CacheError::Decode(e.to_string()))
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        tracing::debug!("Loaded header of {} from {}", sop_instance_uid, location);

        Ok(InstanceMetadata {
            sop_instance_uid: sop_instance_uid.to_string(),
            location,
            header,
        })
    }
}
