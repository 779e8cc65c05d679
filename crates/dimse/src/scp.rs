//! Service Class Provider (SCP) listener for inbound C-ECHO and C-STORE

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::association::{Association, AssociationAcceptor};
use crate::config::DimseConfig;
use crate::types::{DimseRequest, DimseRequestPayload, DimseResponse, DimseStatus, StoreRequest};
use crate::ul::UlAcceptor;
use crate::{DimseError, Result};

/// Time aborted associations get to wind down before the listener stops anyway
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Storage pipeline behind the listener
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Decide whether a transfer from `calling_aet` may proceed
    fn authorize(&self, calling_aet: &str) -> bool;

    /// Handle an authorized C-STORE and return the status reported to the peer
    async fn store(&self, calling_aet: &str, request: StoreRequest) -> DimseStatus;
}

/// Observable listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    AssociationEstablishing,
    AssociationActive(usize),
    Draining,
    Stopped,
}

/// How an association ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationOutcome {
    /// The peer released the association
    Released,
    /// A transfer came from a peer the provider refused; the association was aborted
    Unauthorized,
    /// No request arrived within the idle timeout
    IdleTimeout,
    /// The listener shut down before the peer released
    ForcedClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening,
    Draining,
    Stopped,
}

#[derive(Debug)]
struct StateTracker {
    phase: watch::Sender<Phase>,
    establishing: AtomicUsize,
    active: AtomicUsize,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            phase: watch::channel(Phase::Idle).0,
            establishing: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    fn set(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    fn in_flight(&self) -> usize {
        self.establishing.load(Ordering::SeqCst) + self.active.load(Ordering::SeqCst)
    }

    fn current(&self) -> ListenerState {
        match *self.phase.borrow() {
            Phase::Idle => ListenerState::Idle,
            Phase::Draining => ListenerState::Draining,
            Phase::Stopped => ListenerState::Stopped,
            Phase::Listening => {
                let active = self.active.load(Ordering::SeqCst);
                if active > 0 {
                    ListenerState::AssociationActive(active)
                } else if self.establishing.load(Ordering::SeqCst) > 0 {
                    ListenerState::AssociationEstablishing
                } else {
                    ListenerState::Listening
                }
            }
        }
    }
}

/// Increments a counter for as long as it lives
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// DIMSE storage Service Class Provider
pub struct DimseScp {
    config: Arc<DimseConfig>,
    acceptor: Arc<dyn AssociationAcceptor>,
    provider: Arc<dyn StoreProvider>,
    state: StateTracker,
}

impl DimseScp {
    /// Create a new SCP using the `dicom-ul` transport
    pub fn new(config: DimseConfig, provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            config: Arc::new(config),
            acceptor: Arc::new(UlAcceptor::new()),
            provider,
            state: StateTracker::new(),
        }
    }

    /// Replace the association acceptor
    pub fn with_acceptor(mut self, acceptor: Arc<dyn AssociationAcceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        self.state.current()
    }

    /// Validate the configuration and bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        self.config.validate()?;
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve associations on an already bound listener until `shutdown` is cancelled
    ///
    /// On shutdown the listener stops accepting, gives active associations
    /// `drain_timeout` to finish and then aborts the remaining ones.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "Starting DIMSE SCP on {} (AETs: {})",
            local_addr,
            self.config.ae_titles().join(", ")
        );
        self.state.set(Phase::Listening);

        let tracker = TaskTracker::new();
        let force_close = CancellationToken::new();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);

                    if self.state.in_flight() >= self.config.max_associations as usize {
                        warn!(
                            "Maximum associations reached, rejecting connection from {}",
                            peer_addr
                        );
                        drop(stream);
                        continue;
                    }

                    let scp = Arc::clone(&self);
                    let force_close = force_close.clone();
                    tracker.spawn(
                        async move { scp.handle_connection(stream, peer_addr, force_close).await }
                            .instrument(info_span!("association", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        drop(listener);
        self.state.set(Phase::Draining);
        tracker.close();
        info!(
            "DIMSE SCP on {} draining {} association(s)",
            local_addr,
            self.state.in_flight()
        );

        if tokio::time::timeout(self.config.drain_timeout(), tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Drain timeout elapsed, aborting {} association(s)",
                self.state.in_flight()
            );
            force_close.cancel();
            if tokio::time::timeout(FORCE_CLOSE_GRACE, tracker.wait())
                .await
                .is_err()
            {
                error!(
                    "{} association(s) still running {:?} after abort, leaving them behind",
                    self.state.in_flight(),
                    FORCE_CLOSE_GRACE
                );
            }
        }

        self.state.set(Phase::Stopped);
        info!("DIMSE SCP on {} stopped", local_addr);
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        force_close: CancellationToken,
    ) {
        let association = {
            let _establishing = CountGuard::new(&self.state.establishing);
            let accepted = tokio::select! {
                _ = force_close.cancelled() => return,
                accepted = tokio::time::timeout(
                    self.config.accept_timeout(),
                    self.acceptor.accept(stream, peer_addr, &self.config),
                ) => accepted,
            };
            match accepted {
                Ok(Ok(association)) => association,
                Ok(Err(DimseError::ClosedBeforeNegotiation)) => {
                    debug!("Connection from {} closed before negotiation", peer_addr);
                    return;
                }
                Ok(Err(e)) => {
                    warn!("Association negotiation with {} failed: {}", peer_addr, e);
                    return;
                }
                Err(_) => {
                    warn!("Association negotiation with {} timed out", peer_addr);
                    return;
                }
            }
        };

        let _active = CountGuard::new(&self.state.active);
        match self.serve_association(association, &force_close).await {
            Ok(outcome) => info!("Association with {} ended: {:?}", peer_addr, outcome),
            Err(e) if e.is_recoverable() => {
                warn!("Association with {} failed: {}", peer_addr, e)
            }
            Err(e) => error!("Association with {} failed: {}", peer_addr, e),
        }
    }

    /// Process requests on an established association until it ends
    ///
    /// Requests are handled strictly in arrival order.
    pub async fn serve_association(
        &self,
        mut association: Box<dyn Association>,
        force_close: &CancellationToken,
    ) -> Result<AssociationOutcome> {
        let calling_aet = association.calling_ae_title().trim().to_string();
        let idle_timeout = self.config.idle_timeout();

        loop {
            let next = tokio::select! {
                biased;
                _ = force_close.cancelled() => {
                    association.abort().await?;
                    return Ok(AssociationOutcome::ForcedClose);
                }
                next = tokio::time::timeout(idle_timeout, association.next_request()) => next,
            };

            let request = match next {
                Err(_) => {
                    warn!("Association with {} idle for {:?}, aborting", calling_aet, idle_timeout);
                    association.abort().await?;
                    return Ok(AssociationOutcome::IdleTimeout);
                }
                Ok(Ok(Some(request))) => request,
                Ok(Ok(None)) => return Ok(AssociationOutcome::Released),
                Ok(Err(e)) => return Err(e),
            };

            debug!(
                "{} request {} (message {}) from {}",
                request.command(),
                request.id,
                request.message_id,
                calling_aet
            );

            if matches!(request.payload, DimseRequestPayload::Store(_))
                && !self.provider.authorize(&calling_aet)
            {
                association.abort().await?;
                return Ok(AssociationOutcome::Unauthorized);
            }

            let answered = tokio::select! {
                biased;
                _ = force_close.cancelled() => None,
                answered = self.answer(association.as_mut(), &calling_aet, &request) => Some(answered),
            };
            match answered {
                Some(result) => result?,
                None => {
                    warn!(
                        "Aborting association with {} during message {}",
                        calling_aet, request.message_id
                    );
                    association.abort().await?;
                    return Ok(AssociationOutcome::ForcedClose);
                }
            }
        }
    }

    /// Run one request through the provider and write its response
    ///
    /// A zero `response_timeout` leaves the write unbounded.
    async fn answer(
        &self,
        association: &mut dyn Association,
        calling_aet: &str,
        request: &DimseRequest,
    ) -> Result<()> {
        let status = match &request.payload {
            DimseRequestPayload::Echo { .. } => DimseStatus::Success,
            DimseRequestPayload::Store(store) => {
                self.provider.store(calling_aet, store.clone()).await
            }
        };

        let response = DimseResponse::for_request(request, status);
        let response_timeout = self.config.response_timeout();
        if response_timeout.is_zero() {
            return association.respond(response).await;
        }
        tokio::time::timeout(response_timeout, association.respond(response))
            .await
            .map_err(|_| DimseError::Timeout(format!("response to {}", calling_aet)))?
    }
}

/// Wait until something accepts TCP connections on `addr`
pub async fn wait_until_ready(addr: SocketAddr, connect_timeout: Duration) -> bool {
    let target = if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    };

    for _ in 0..40 {
        if let Ok(Ok(_)) = tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
