use crate::storage::{DicomFile, StorageBackend, StorageError, StorageItem, StorageResult};
use futures_util::future::join_all;
use std::sync::Arc;
use url::Url;

/// Fans objects out to every registered backend and routes location-based
/// operations to the backend owning the location's scheme.
#[derive(Debug, Clone, Default)]
pub struct StorageRouter {
    backends: Vec<Arc<dyn StorageBackend>>,
}

impl StorageRouter {
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        Self { backends }
    }

    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Arc<dyn StorageBackend>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Store an object on every backend.
    ///
    /// Backends run concurrently on their own tasks. A backend that errors,
    /// panics or declines contributes nothing; the others are unaffected.
    pub async fn store(&self, object: Arc<DicomFile>) -> Vec<Url> {
        let tasks = self.backends.iter().map(|backend| {
            let backend = Arc::clone(backend);
            let object = Arc::clone(&object);
            tokio::spawn(async move { backend.store(&object).await })
        });
        let results = join_all(tasks).await;

        let mut locations = Vec::with_capacity(self.backends.len());
        for (backend, result) in self.backends.iter().zip(results) {
            match result {
                Ok(Ok(Some(location))) => {
                    tracing::debug!(storage = backend.name(), "Stored object at {}", location);
                    locations.push(location);
                }
                Ok(Ok(None)) => {
                    tracing::debug!(storage = backend.name(), "Backend declined object");
                }
                Ok(Err(e)) => {
                    tracing::warn!(storage = backend.name(), "Failed to store object: {}", e);
                }
                Err(e) => {
                    tracing::error!(storage = backend.name(), "Storage task failed: {}", e);
                }
            }
        }
        locations
    }

    /// The backend owning `location`'s scheme
    pub fn backend_for(&self, location: &Url) -> StorageResult<&Arc<dyn StorageBackend>> {
        self.backends
            .iter()
            .find(|backend| backend.handles(location))
            .ok_or_else(|| StorageError::UnsupportedScheme(location.scheme().to_string()))
    }

    /// Everything stored at `location`
    pub async fn resolve(&self, location: &Url) -> StorageResult<Vec<StorageItem>> {
        self.backend_for(location)?.at(location).await
    }

    /// The single item stored at `location`
    pub async fn get(&self, location: &Url) -> StorageResult<Option<StorageItem>> {
        self.backend_for(location)?.get(location).await
    }

    pub async fn remove(&self, location: &Url) -> StorageResult<()> {
        self.backend_for(location)?.remove(location).await
    }
}
