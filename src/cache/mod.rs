//! Header metadata cache keyed by SOP Instance UID
//!
//! Lookups that miss go through a [`MetadataLoader`]. Concurrent misses on the
//! same UID share one load. Entries leave the cache when they have been idle
//! for longer than the configured window or when the LRU bound pushes them out.

use crate::storage::DicomFile;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod loader;

pub use loader::{IndexedMetadataLoader, MetadataLoader};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("No indexed instance with SOPInstanceUID {0}")]
    NotFound(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to decode header: {0}")]
    Decode(String),

    #[error("Loader task failed: {0}")]
    Task(String),

    #[error("A metadata cache is already installed")]
    AlreadyInstalled,
}

/// Cache sizing and expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_time_to_idle")]
    pub time_to_idle_secs: u64,

    /// How often expired entries are swept; 0 disables the sweeper
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            time_to_idle_secs: default_time_to_idle(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn time_to_idle(&self) -> Duration {
        Duration::from_secs(self.time_to_idle_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn default_max_entries() -> usize {
    1_000
}

fn default_time_to_idle() -> u64 {
    3_600
}

fn default_sweep_interval() -> u64 {
    60
}

/// Header of one stored instance. Pixel data is not loaded; `location` points
/// at the full object.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    pub sop_instance_uid: String,
    pub location: Url,
    pub header: DicomFile,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub entries: usize,
}

type LoadResult = Result<Arc<InstanceMetadata>, CacheError>;

struct CacheEntry {
    value: Arc<InstanceMetadata>,
    last_access: Instant,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    loading: HashMap<String, Arc<OnceCell<LoadResult>>>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

pub struct MetadataCache {
    state: Mutex<CacheState>,
    loader: Arc<dyn MetadataLoader>,
    time_to_idle: Duration,
    sweep_interval: Option<Duration>,
    counters: Counters,
}

impl MetadataCache {
    pub fn new(config: &CacheConfig, loader: Arc<dyn MetadataLoader>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                loading: HashMap::new(),
            }),
            loader,
            time_to_idle: config.time_to_idle(),
            sweep_interval: config.sweep_interval(),
            counters: Counters::default(),
        }
    }

    /// Override the idle window with sub-second precision
    pub fn with_time_to_idle(mut self, time_to_idle: Duration) -> Self {
        self.time_to_idle = time_to_idle;
        self
    }

    /// Install this cache as the process-wide instance
    pub fn install(self) -> Result<Arc<Self>, CacheError> {
        let cache = Arc::new(self);
        crate::globals::install_metadata_cache(Arc::clone(&cache))?;
        Ok(cache)
    }

    /// Metadata for `sop_instance_uid`, loading it on a miss.
    ///
    /// Failed loads are returned to every waiter and are not cached.
    pub async fn get(&self, sop_instance_uid: &str) -> LoadResult {
        let cell = {
            let mut state = self.state.lock();
            if let Some(value) = self.lookup(&mut state, sop_instance_uid) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            Arc::clone(
                state
                    .loading
                    .entry(sop_instance_uid.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let result = cell
            .get_or_init(|| async {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                let loaded = self.loader.load(sop_instance_uid).await.map(Arc::new);
                if let Err(e) = &loaded {
                    self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Metadata load for {} failed: {}", sop_instance_uid, e);
                }
                loaded
            })
            .await
            .clone();

        // First waiter back publishes the result and retires the cell
        let mut state = self.state.lock();
        let current = state
            .loading
            .get(sop_instance_uid)
            .is_some_and(|c| Arc::ptr_eq(c, &cell));
        if current {
            state.loading.remove(sop_instance_uid);
            if let Ok(value) = &result {
                self.insert(&mut state, sop_instance_uid, Arc::clone(value));
            }
        }

        result
    }

    fn lookup(&self, state: &mut CacheState, key: &str) -> Option<Arc<InstanceMetadata>> {
        let now = Instant::now();
        let expired = match state.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_access) <= self.time_to_idle => {
                entry.last_access = now;
                return Some(Arc::clone(&entry.value));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.pop(key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn insert(&self, state: &mut CacheState, key: &str, value: Arc<InstanceMetadata>) {
        let entry = CacheEntry {
            value,
            last_access: Instant::now(),
        };
        if let Some((evicted, _)) = state.entries.push(key.to_string(), entry) {
            if evicted != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every entry idle for longer than the window; returns how many
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access) > self.time_to_idle)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.pop(key);
        }
        self.counters
            .evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn invalidate(&self, sop_instance_uid: &str) -> bool {
        self.state.lock().entries.pop(sop_instance_uid).is_some()
    }

    pub fn invalidate_all(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Periodically purge expired entries until `shutdown` fires.
    ///
    /// Returns `None` when the sweep interval is disabled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.sweep_interval?;
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!("Purged {} idle metadata entries", purged);
                        }
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("time_to_idle", &self.time_to_idle)
            .field("stats", &self.stats())
            .finish()
    }
}
