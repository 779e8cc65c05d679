use crate::cache::{CacheError, MetadataCache};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;

static METADATA_CACHE_CELL: Lazy<RwLock<Option<Arc<MetadataCache>>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the process-wide metadata cache. Fails if one is already installed.
pub fn install_metadata_cache(cache: Arc<MetadataCache>) -> Result<(), CacheError> {
    let mut cell = METADATA_CACHE_CELL.write();
    if cell.is_some() {
        return Err(CacheError::AlreadyInstalled);
    }
    *cell = Some(cache);
    Ok(())
}

pub fn metadata_cache() -> Option<Arc<MetadataCache>> {
    METADATA_CACHE_CELL.read().clone()
}

/// Reset the global metadata cache. Primarily for testing purposes.
/// In production, the cache should only be installed once during initialization.
pub fn reset_metadata_cache() {
    *METADATA_CACHE_CELL.write() = None;
}
