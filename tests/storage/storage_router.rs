#[path = "../common/mod.rs"]
mod common;

use archivist::decode::read_header;
use archivist::storage::{
    DicomFile, StorageBackend, StorageError, StorageItem, StorageResult, StorageRouter,
};
use async_trait::async_trait;
use common::{FailingBackend, Instance, MemoryBackend};
use std::sync::Arc;
use url::Url;

#[derive(Debug)]
struct PanickingBackend;

#[async_trait]
impl StorageBackend for PanickingBackend {
    fn name(&self) -> &str {
        "panicking"
    }

    fn scheme(&self) -> &str {
        "panic"
    }

    async fn store(&self, _object: &DicomFile) -> StorageResult<Option<Url>> {
        panic!("backend bug");
    }

    async fn remove(&self, _location: &Url) -> StorageResult<()> {
        Ok(())
    }

    async fn at(&self, _location: &Url) -> StorageResult<Vec<StorageItem>> {
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct DecliningBackend;

#[async_trait]
impl StorageBackend for DecliningBackend {
    fn name(&self) -> &str {
        "declining"
    }

    fn scheme(&self) -> &str {
        "decline"
    }

    async fn store(&self, _object: &DicomFile) -> StorageResult<Option<Url>> {
        Ok(None)
    }

    async fn remove(&self, _location: &Url) -> StorageResult<()> {
        Ok(())
    }

    async fn at(&self, _location: &Url) -> StorageResult<Vec<StorageItem>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn failing_backend_does_not_affect_the_others() {
    let first = Arc::new(MemoryBackend::new("first", "mem1"));
    let third = Arc::new(MemoryBackend::new("third", "mem3"));
    let backends: Vec<Arc<dyn StorageBackend>> =
        vec![first.clone(), Arc::new(FailingBackend), third.clone()];
    let router = StorageRouter::new(backends);

    let object = Arc::new(Instance::new("1.2.3.4").file());
    let locations = router.store(object).await;

    assert_eq!(locations.len(), 2);
    let schemes: Vec<&str> = locations.iter().map(|l| l.scheme()).collect();
    assert!(schemes.contains(&"mem1"));
    assert!(schemes.contains(&"mem3"));
    assert_eq!(first.stored(), 1);
    assert_eq!(third.stored(), 1);
}

#[tokio::test]
async fn panicking_or_declining_backends_contribute_nothing() {
    let memory = Arc::new(MemoryBackend::new("memory", "mem"));
    let backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(PanickingBackend),
        Arc::new(DecliningBackend),
        memory.clone(),
    ];
    let router = StorageRouter::new(backends);

    let locations = router.store(Arc::new(Instance::new("1.2.3.5").file())).await;
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].scheme(), "mem");
}

#[tokio::test]
async fn no_backends_means_no_locations() {
    let router = StorageRouter::default();
    assert!(router.is_empty());
    assert!(router
        .store(Arc::new(Instance::new("1.2.3.6").file()))
        .await
        .is_empty());
}

#[tokio::test]
async fn resolve_goes_to_the_backend_owning_the_scheme() {
    let a = Arc::new(MemoryBackend::new("a", "mema"));
    let b = Arc::new(MemoryBackend::new("b", "memb"));
    let backends: Vec<Arc<dyn StorageBackend>> = vec![a.clone(), b.clone()];
    let router = StorageRouter::new(backends);

    let locations = router.store(Arc::new(Instance::new("1.2.3.7").file())).await;
    let on_b = locations
        .iter()
        .find(|l| l.scheme() == "memb")
        .expect("stored on b");

    let items = router.resolve(on_b).await.unwrap();
    assert_eq!(items.len(), 1);
    let header = read_header(items[0].open().unwrap()).unwrap();
    assert_eq!(header.meta().media_storage_sop_instance_uid(), "1.2.3.7");

    router.remove(on_b).await.unwrap();
    assert_eq!(b.stored(), 0);
    assert_eq!(a.stored(), 1);
}

#[tokio::test]
async fn unknown_scheme_is_an_error() {
    let mut router = StorageRouter::default();
    router.register(Arc::new(MemoryBackend::new("a", "mema")));
    let location = Url::parse("s3://bucket/key.dcm").unwrap();

    assert!(matches!(
        router.resolve(&location).await,
        Err(StorageError::UnsupportedScheme(_))
    ));
    assert!(matches!(
        router.remove(&location).await,
        Err(StorageError::UnsupportedScheme(_))
    ));
}
