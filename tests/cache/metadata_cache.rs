#[path = "../common/mod.rs"]
mod common;

use archivist::cache::{
    CacheConfig, CacheError, IndexedMetadataLoader, InstanceMetadata, MetadataCache,
    MetadataLoader,
};
use archivist::globals;
use archivist::indexing::Indexer;
use archivist::query::RedbIndex;
use archivist::storage::{FilesystemStorage, StorageBackend, StorageRouter};
use async_trait::async_trait;
use common::Instance;
use dicom_dictionary_std::tags;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

/// Loader that counts calls and takes its time
#[derive(Default)]
struct SlowLoader {
    loads: AtomicUsize,
}

#[async_trait]
impl MetadataLoader for SlowLoader {
    async fn load(&self, sop_instance_uid: &str) -> Result<InstanceMetadata, CacheError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(InstanceMetadata {
            sop_instance_uid: sop_instance_uid.to_string(),
            location: Url::parse(&format!("file:///archive/{}.dcm", sop_instance_uid)).unwrap(),
            header: Instance::new(sop_instance_uid).file(),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_share_one_load() {
    let loader = Arc::new(SlowLoader::default());
    let cache = Arc::new(MetadataCache::new(&CacheConfig::default(), loader.clone()));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move { cache.get("1.2.3.4").await }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().expect("load succeeds"));
    }

    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().loads, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_load_in_parallel() {
    let loader = Arc::new(SlowLoader::default());
    let cache = Arc::new(MetadataCache::new(&CacheConfig::default(), loader.clone()));

    let started = std::time::Instant::now();
    let first = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.get("1.2.3.1").await }
    });
    let second = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.get("1.2.3.2").await }
    });
    let first = first.await.unwrap().expect("first load");
    let second = second.await.unwrap().expect("second load");
    let elapsed = started.elapsed();

    assert_eq!(first.sop_instance_uid, "1.2.3.1");
    assert_eq!(second.sop_instance_uid, "1.2.3.2");
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    // two 100 ms loads in series would take at least 200 ms
    assert!(elapsed < Duration::from_millis(200), "loads ran in series: {:?}", elapsed);
}

#[tokio::test]
async fn idle_entries_are_reloaded() {
    let loader = Arc::new(SlowLoader::default());
    let cache = MetadataCache::new(&CacheConfig::default(), loader.clone())
        .with_time_to_idle(Duration::from_millis(150));

    cache.get("1.2.3.4").await.unwrap();
    cache.get("1.2.3.4").await.unwrap();
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    cache.get("1.2.3.4").await.unwrap();
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn access_keeps_entries_alive() {
    let loader = Arc::new(SlowLoader::default());
    let cache = MetadataCache::new(&CacheConfig::default(), loader.clone())
        .with_time_to_idle(Duration::from_millis(400));

    cache.get("1.2.3.4").await.unwrap();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.get("1.2.3.4").await.unwrap();
    }
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn purge_drops_idle_entries() {
    let cache = MetadataCache::new(&CacheConfig::default(), Arc::new(SlowLoader::default()))
        .with_time_to_idle(Duration::from_millis(50));

    cache.get("a").await.unwrap();
    cache.get("b").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cache.purge_expired(), 2);
    assert!(cache.is_empty());
    assert_eq!(cache.stats().evictions, 2);
}

#[tokio::test]
async fn indexed_loader_reads_header_from_storage() {
    let temp_dir = TempDir::new().unwrap();
    let storage = Arc::new(FilesystemStorage::new(temp_dir.path().join("store")).unwrap());
    let mut router = StorageRouter::default();
    router.register(storage.clone());
    let router = Arc::new(router);

    let index = Arc::new(RedbIndex::open(&temp_dir.path().join("index.redb"), router.clone()).unwrap());

    let location = storage
        .store(&Instance::new("1.2.3.200").file())
        .await
        .unwrap()
        .unwrap();
    index.index(&location).await.unwrap();

    let cache = MetadataCache::new(
        &CacheConfig::default(),
        Arc::new(IndexedMetadataLoader::new(index.clone(), router.clone())),
    );

    let metadata = cache.get("1.2.3.200").await.unwrap();
    assert_eq!(metadata.location, location);
    assert_eq!(
        metadata.header.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
        "PAT001"
    );
    assert!(metadata.header.element(tags::PIXEL_DATA).is_err());

    assert_eq!(
        cache.get("9.9.9").await.unwrap_err(),
        CacheError::NotFound("9.9.9".to_string())
    );
}

#[test]
#[serial]
fn global_cache_installs_once() {
    globals::reset_metadata_cache();
    assert!(globals::metadata_cache().is_none());

    let first = MetadataCache::new(&CacheConfig::default(), Arc::new(SlowLoader::default()))
        .install()
        .expect("first install");
    assert!(Arc::ptr_eq(&first, &globals::metadata_cache().unwrap()));

    let second = MetadataCache::new(&CacheConfig::default(), Arc::new(SlowLoader::default()))
        .install();
    assert_eq!(second.unwrap_err(), CacheError::AlreadyInstalled);

    globals::reset_metadata_cache();
    assert!(globals::metadata_cache().is_none());
}
