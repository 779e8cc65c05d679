use crate::access::AccessGate;
use crate::config::Config;
use crate::indexing::{
    Indexer, IndexingWorker, PriorityIndexQueue, ShutdownMode, WorkerSummary,
};
use crate::service::StoreService;
use crate::storage::StorageRouter;
use anyhow::Context;
use dimse::{AssociationAcceptor, DimseScp, ListenerState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The storage listener wired to storage, indexing and access control
pub struct ArchiveServer {
    scp: DimseScp,
    queue: Arc<PriorityIndexQueue>,
    router: Arc<StorageRouter>,
    indexers: Vec<Arc<dyn Indexer>>,
    shutdown_mode: ShutdownMode,
    indexing_timeout: Duration,
}

/// Slack on top of the drain timeout for the listener to abort what is left and exit
const LISTENER_STOP_MARGIN: Duration = Duration::from_secs(10);

impl ArchiveServer {
    pub fn new(config: &Config, router: Arc<StorageRouter>, indexers: Vec<Arc<dyn Indexer>>) -> Self {
        let queue = Arc::new(PriorityIndexQueue::with_priority_aets(
            config.indexing.priority_aets.iter().cloned(),
        ));

        if config.access.denies_everyone() {
            tracing::warn!("Access list is empty and permit_all is off; every store will be refused");
        }

        let service = StoreService::new(
            AccessGate::new(config.access.clone()),
            Arc::clone(&router),
            Arc::clone(&queue),
        )
        .with_reject_unstored(config.indexing.reject_unstored);

        let scp = DimseScp::new(config.dimse.clone(), Arc::new(service));

        Self {
            scp,
            queue,
            router,
            indexers,
            shutdown_mode: config.indexing.shutdown_mode,
            indexing_timeout: config.indexing.shutdown_timeout(),
        }
    }

    /// Replace the association transport
    pub fn with_acceptor(mut self, acceptor: Arc<dyn AssociationAcceptor>) -> Self {
        self.scp = self.scp.with_acceptor(acceptor);
        self
    }

    pub fn queue(&self) -> &Arc<PriorityIndexQueue> {
        &self.queue
    }

    pub fn router(&self) -> &Arc<StorageRouter> {
        &self.router
    }

    pub fn scp(&self) -> &DimseScp {
        &self.scp
    }

    /// Bind the listener, start the indexing worker and wait until the port
    /// accepts connections.
    pub async fn start(self) -> anyhow::Result<ServerHandle> {
        let scp = Arc::new(self.scp);
        let listener = scp
            .bind()
            .await
            .context("failed to bind DIMSE listener")?;
        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;

        let config = scp.config();
        tracing::info!(
            "🚀 Starting storage listener {:?} on {}",
            config.ae_titles(),
            local_addr
        );

        let listener_shutdown = CancellationToken::new();
        let worker_shutdown = CancellationToken::new();

        let worker = IndexingWorker::new(Arc::clone(&self.queue), self.indexers)
            .with_shutdown_mode(self.shutdown_mode)
            .spawn(worker_shutdown.clone());

        let listener_task = tokio::spawn(
            Arc::clone(&scp).serve(listener, listener_shutdown.clone()),
        );

        let ready_addr = connect_addr(local_addr);
        if !dimse::wait_until_ready(ready_addr, config.connect_timeout()).await {
            tracing::warn!("Listener on {} did not accept a readiness connection", ready_addr);
        }

        Ok(ServerHandle {
            local_addr,
            scp: Arc::clone(&scp),
            queue: self.queue,
            listener_shutdown,
            worker_shutdown,
            listener: listener_task,
            worker,
            listener_timeout: config.drain_timeout() + LISTENER_STOP_MARGIN,
            indexing_timeout: self.indexing_timeout,
        })
    }
}

fn connect_addr(local_addr: SocketAddr) -> SocketAddr {
    if local_addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port())
    } else {
        local_addr
    }
}

/// A running [`ArchiveServer`]
pub struct ServerHandle {
    local_addr: SocketAddr,
    scp: Arc<DimseScp>,
    queue: Arc<PriorityIndexQueue>,
    listener_shutdown: CancellationToken,
    worker_shutdown: CancellationToken,
    listener: JoinHandle<dimse::Result<()>>,
    worker: JoinHandle<WorkerSummary>,
    listener_timeout: Duration,
    indexing_timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listener_state(&self) -> ListenerState {
        self.scp.state()
    }

    pub fn queue(&self) -> &Arc<PriorityIndexQueue> {
        &self.queue
    }

    /// Stop accepting, drain associations, then stop the indexing worker.
    ///
    /// The listener gets the drain timeout plus a fixed margin before its task is
    /// aborted. The worker gets at most the configured indexing timeout; past
    /// that it is aborted and whatever is still queued is lost.
    pub async fn shutdown(self) -> anyhow::Result<WorkerSummary> {
        tracing::info!("Storage listener on {} shutting down", self.local_addr);
        self.listener_shutdown.cancel();
        let mut listener = self.listener;
        match tokio::time::timeout(self.listener_timeout, &mut listener).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!("Storage listener failed: {}", e),
            Ok(Err(e)) => tracing::error!("Storage listener task failed: {}", e),
            Err(_) => {
                listener.abort();
                tracing::error!(
                    "Storage listener did not stop within {:?}; aborted",
                    self.listener_timeout
                );
            }
        }

        self.worker_shutdown.cancel();
        let mut worker = self.worker;
        match tokio::time::timeout(self.indexing_timeout, &mut worker).await {
            Ok(summary) => {
                let summary = summary.context("indexing worker task failed")?;
                tracing::info!("Storage listener on {} shut down", self.local_addr);
                Ok(summary)
            }
            Err(_) => {
                worker.abort();
                let abandoned = self.queue.len();
                tracing::error!(
                    "Indexing worker did not stop within {:?}; abandoning {} entries",
                    self.indexing_timeout,
                    abandoned
                );
                Ok(WorkerSummary {
                    abandoned,
                    ..Default::default()
                })
            }
        }
    }
}
