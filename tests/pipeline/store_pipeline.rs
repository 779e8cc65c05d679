#[path = "../common/mod.rs"]
mod common;

use archivist::access::{AccessGate, AccessPolicy};
use archivist::config::Config;
use archivist::indexing::{Indexer, IndexingWorker, PriorityIndexQueue};
use archivist::server::ArchiveServer;
use archivist::service::StoreService;
use archivist::storage::{StorageBackend, StorageRouter};
use async_trait::async_trait;
use bytes::Bytes;
use common::{HangingBackend, Instance, MemoryBackend, RecordingIndexer};
use dicom_dictionary_std::uids;
use dimse::{
    Association, AssociationAcceptor, AssociationOutcome, DatasetStream, DimseConfig,
    DimseRequest, DimseResponse, DimseScp, DimseStatus, ListenerState, StoreProvider,
    StoreRequest,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Association that replays a fixed list of requests, then releases
struct ScriptedAssociation {
    calling_aet: String,
    requests: VecDeque<DimseRequest>,
    responses: Arc<Mutex<Vec<DimseResponse>>>,
    aborted: Arc<AtomicBool>,
}

impl ScriptedAssociation {
    fn new(calling_aet: &str, requests: Vec<DimseRequest>) -> Self {
        Self {
            calling_aet: calling_aet.to_string(),
            requests: requests.into(),
            responses: Arc::default(),
            aborted: Arc::default(),
        }
    }
}

#[async_trait]
impl Association for ScriptedAssociation {
    fn calling_ae_title(&self) -> &str {
        &self.calling_aet
    }

    async fn next_request(&mut self) -> dimse::Result<Option<DimseRequest>> {
        Ok(self.requests.pop_front())
    }

    async fn respond(&mut self, response: DimseResponse) -> dimse::Result<()> {
        self.responses.lock().unwrap().push(response);
        Ok(())
    }

    async fn abort(&mut self) -> dimse::Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out scripted associations to incoming TCP connections.
///
/// Connections that arrive with nothing scripted (the readiness check) are
/// treated as closed before negotiation.
#[derive(Default)]
struct ScriptedAcceptor {
    pending: Mutex<VecDeque<ScriptedAssociation>>,
}

#[async_trait]
impl AssociationAcceptor for ScriptedAcceptor {
    async fn accept(
        &self,
        _stream: TcpStream,
        _peer_addr: SocketAddr,
        _config: &DimseConfig,
    ) -> dimse::Result<Box<dyn Association>> {
        match self.pending.lock().unwrap().pop_front() {
            Some(association) => Ok(Box::new(association)),
            None => Err(dimse::DimseError::ClosedBeforeNegotiation),
        }
    }
}

fn store_request(instance: &Instance) -> StoreRequest {
    StoreRequest {
        dataset: instance.stream(),
    }
}

fn service_with(
    backends: Vec<Arc<dyn StorageBackend>>,
    priority_aets: &[&str],
) -> (StoreService, Arc<PriorityIndexQueue>) {
    let queue = Arc::new(PriorityIndexQueue::with_priority_aets(
        priority_aets.iter().copied(),
    ));
    let service = StoreService::new(
        AccessGate::new(AccessPolicy::allow(["AE1", "AE2"])),
        Arc::new(StorageRouter::new(backends)),
        Arc::clone(&queue),
    );
    (service, queue)
}

#[tokio::test]
async fn priority_peer_objects_are_indexed_first() {
    let memory = Arc::new(MemoryBackend::new("memory", "mem"));
    let (service, queue) = service_with(vec![memory.clone() as Arc<dyn StorageBackend>], &["AE1"]);

    let from_ae2 = service
        .store("AE2", store_request(&Instance::new("1.2.3.20")))
        .await;
    let from_ae1 = service
        .store("AE1", store_request(&Instance::new("1.2.3.10")))
        .await;
    assert_eq!(from_ae2, DimseStatus::Success);
    assert_eq!(from_ae1, DimseStatus::Success);
    assert_eq!(memory.stored(), 2);
    assert_eq!(queue.len(), 2);

    let indexer = Arc::new(RecordingIndexer::default());
    let shutdown = CancellationToken::new();
    let worker = IndexingWorker::new(queue.clone(), vec![indexer.clone() as Arc<dyn Indexer>])
        .spawn(shutdown.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while indexer.seen().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both objects indexed");
    shutdown.cancel();
    worker.await.unwrap();

    let seen = indexer.seen();
    assert!(seen[0].path().ends_with("1.2.3.10.dcm"));
    assert!(seen[1].path().ends_with("1.2.3.20.dcm"));
}

#[tokio::test]
async fn each_backend_location_is_queued() {
    let first = Arc::new(MemoryBackend::new("first", "mema"));
    let second = Arc::new(MemoryBackend::new("second", "memb"));
    let (service, queue) = service_with(
        vec![
            first.clone() as Arc<dyn StorageBackend>,
            second.clone() as Arc<dyn StorageBackend>,
        ],
        &[],
    );

    let status = service
        .store("AE1", store_request(&Instance::new("1.2.3.30")))
        .await;
    assert!(status.is_success());

    let mut schemes: Vec<String> = std::iter::from_fn(|| queue.try_pop())
        .map(|entry| {
            assert_eq!(entry.origin_aet, "AE1");
            entry.location.scheme().to_string()
        })
        .collect();
    schemes.sort();
    assert_eq!(schemes, vec!["mema", "memb"]);
}

#[tokio::test]
async fn unauthorized_peer_is_aborted_and_nothing_is_stored() {
    let memory = Arc::new(MemoryBackend::new("memory", "mem"));
    let (service, queue) = service_with(vec![memory.clone() as Arc<dyn StorageBackend>], &["AE1"]);
    let scp = DimseScp::new(DimseConfig::default(), Arc::new(service));

    let association =
        ScriptedAssociation::new("AE3", vec![Instance::new("1.2.3.40").store_request(1)]);
    let aborted = Arc::clone(&association.aborted);
    let responses = Arc::clone(&association.responses);

    let outcome = scp
        .serve_association(Box::new(association), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, AssociationOutcome::Unauthorized);
    assert!(aborted.load(Ordering::SeqCst));
    assert!(responses.lock().unwrap().is_empty());
    assert_eq!(memory.stored(), 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn authorized_association_gets_a_response_per_request() {
    let memory = Arc::new(MemoryBackend::new("memory", "mem"));
    let (service, queue) = service_with(vec![memory.clone() as Arc<dyn StorageBackend>], &[]);
    let scp = DimseScp::new(DimseConfig::default(), Arc::new(service));

    let association = ScriptedAssociation::new(
        "AE2",
        vec![
            DimseRequest::echo(1, 1),
            Instance::new("1.2.3.50").store_request(2),
            Instance::new("1.2.3.51").store_request(3),
        ],
    );
    let responses = Arc::clone(&association.responses);

    let outcome = scp
        .serve_association(Box::new(association), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, AssociationOutcome::Released);

    let responses = responses.lock().unwrap();
    let ids: Vec<u16> = responses.iter().map(|r| r.message_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(responses.iter().all(|r| r.status.is_success()));
    assert_eq!(
        responses[2].sop_instance_uid.as_deref(),
        Some("1.2.3.51")
    );
    assert_eq!(memory.stored(), 2);
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn undecodable_data_sets_are_refused() {
    let memory = Arc::new(MemoryBackend::new("memory", "mem"));
    let (service, queue) = service_with(vec![memory.clone() as Arc<dyn StorageBackend>], &[]);

    let empty = StoreRequest {
        dataset: DatasetStream::new(
            Bytes::new(),
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            uids::CT_IMAGE_STORAGE,
            "1.2.3.60",
        ),
    };
    assert_eq!(
        service.store("AE1", empty).await,
        DimseStatus::Failure(0x0110)
    );

    let unknown_syntax = StoreRequest {
        dataset: DatasetStream::new(
            Bytes::from_static(&[0u8; 16]),
            "1.2.3.4.5.6.7.8.9",
            uids::CT_IMAGE_STORAGE,
            "1.2.3.61",
        ),
    };
    assert_eq!(
        service.store("AE1", unknown_syntax).await,
        DimseStatus::Failure(0x0110)
    );

    assert_eq!(memory.stored(), 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn association_survives_an_undecodable_transfer() {
    let memory = Arc::new(MemoryBackend::new("memory", "mem"));
    let (service, queue) = service_with(vec![memory.clone() as Arc<dyn StorageBackend>], &[]);
    let scp = DimseScp::new(DimseConfig::default(), Arc::new(service));

    let broken = DimseRequest::store(
        1,
        1,
        StoreRequest {
            dataset: DatasetStream::new(
                Bytes::new(),
                uids::EXPLICIT_VR_LITTLE_ENDIAN,
                uids::CT_IMAGE_STORAGE,
                "1.2.3.62",
            ),
        },
    );
    let association = ScriptedAssociation::new(
        "AE1",
        vec![broken, Instance::new("1.2.3.63").store_request(2)],
    );
    let responses = Arc::clone(&association.responses);
    let aborted = Arc::clone(&association.aborted);

    let outcome = scp
        .serve_association(Box::new(association), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, AssociationOutcome::Released);
    assert!(!aborted.load(Ordering::SeqCst));
    let statuses: Vec<DimseStatus> = responses.lock().unwrap().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![DimseStatus::Failure(0x0110), DimseStatus::Success]);
    assert_eq!(memory.stored(), 1);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn unstored_objects_follow_reject_setting() {
    let (service, queue) = service_with(Vec::new(), &[]);
    assert_eq!(
        service
            .store("AE1", store_request(&Instance::new("1.2.3.70")))
            .await,
        DimseStatus::Failure(0xA700)
    );

    let lenient = service.with_reject_unstored(false);
    assert_eq!(
        lenient
            .store("AE1", store_request(&Instance::new("1.2.3.71")))
            .await,
        DimseStatus::Success
    );
    assert!(queue.is_empty());
}

#[tokio::test]
async fn server_stores_over_tcp_and_shuts_down() {
    let config: Config = r#"
        [archive]
        id = "pipeline-test"

        [dimse]
        local_aet = "ARCHIVIST"
        bind_addr = "127.0.0.1"
        port = 0
        drain_timeout_ms = 2000

        [access]
        allowed_aets = ["AE1"]

        [indexing]
        priority_aets = ["AE1"]
        shutdown_mode = "drain"
    "#
    .parse()
    .expect("valid config");

    let memory = Arc::new(MemoryBackend::new("memory", "mem"));
    let router = Arc::new(StorageRouter::new(vec![
        memory.clone() as Arc<dyn StorageBackend>
    ]));
    let indexer = Arc::new(RecordingIndexer::default());
    let acceptor = Arc::new(ScriptedAcceptor::default());

    let handle = ArchiveServer::new(&config, router, vec![indexer.clone() as Arc<dyn Indexer>])
        .with_acceptor(acceptor.clone())
        .start()
        .await
        .expect("server starts");

    assert_ne!(handle.local_addr().port(), 0);
    // The readiness check may still be settling
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.listener_state() != ListenerState::Listening {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener settles");

    let association = ScriptedAssociation::new(
        "AE1",
        vec![
            Instance::new("1.2.3.80").store_request(1),
            Instance::new("1.2.3.81").store_request(2),
        ],
    );
    let responses = Arc::clone(&association.responses);
    acceptor.pending.lock().unwrap().push_back(association);
    let _client = TcpStream::connect(handle.local_addr()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while indexer.seen().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stored objects indexed");

    let summary = handle.shutdown().await.expect("clean shutdown");
    assert_eq!(summary.indexed, 2);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(memory.stored(), 2);
    assert_eq!(responses.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn shutdown_is_bounded_by_a_hung_backend() {
    let config: Config = r#"
        [archive]
        id = "pipeline-hung"

        [dimse]
        local_aet = "ARCHIVIST"
        bind_addr = "127.0.0.1"
        port = 0
        drain_timeout_ms = 200

        [access]
        allowed_aets = ["AE1"]
    "#
    .parse()
    .expect("valid config");

    let router = Arc::new(StorageRouter::new(vec![
        Arc::new(HangingBackend) as Arc<dyn StorageBackend>
    ]));
    let acceptor = Arc::new(ScriptedAcceptor::default());
    let handle = ArchiveServer::new(&config, router, Vec::new())
        .with_acceptor(acceptor.clone())
        .start()
        .await
        .expect("server starts");

    let association =
        ScriptedAssociation::new("AE1", vec![Instance::new("1.2.3.90").store_request(1)]);
    let aborted = Arc::clone(&association.aborted);
    let responses = Arc::clone(&association.responses);
    acceptor.pending.lock().unwrap().push_back(association);
    let _client = TcpStream::connect(handle.local_addr()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !matches!(handle.listener_state(), ListenerState::AssociationActive(_)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("association becomes active");

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("shutdown finishes despite the hung store")
        .expect("clean shutdown");
    assert!(aborted.load(Ordering::SeqCst));
    assert!(responses.lock().unwrap().is_empty());
}
