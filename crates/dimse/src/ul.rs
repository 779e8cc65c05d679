//! Upper layer transport backed by `dicom-ul`
//!
//! `dicom-ul` associations are blocking. Each association gets its own blocking
//! thread which owns the socket, reassembles DIMSE messages and writes responses;
//! the async side talks to it through channels.

use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, SocketAddr};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_ul::association::server::{AccessControl, ServerAssociationOptions};
use dicom_ul::pdu::{AssociationRJServiceUserReason, PDataValueType, Pdu, UserIdentity};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::association::{Association, AssociationAcceptor};
use crate::config::DimseConfig;
use crate::message::{self, MessageAssembler};
use crate::types::{DimseRequest, DimseResponse};
use crate::{DimseError, Result};

/// How long `abort` waits for the transport thread to emit the A-ABORT itself
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Accepts associations for every configured AE title
#[derive(Debug, Default, Clone)]
pub struct UlAcceptor;

impl UlAcceptor {
    pub fn new() -> Self {
        Self
    }
}

/// Called AE title check covering the primary and the alternative AE titles
#[derive(Debug, Clone)]
struct CalledAeTitles(HashSet<String>);

impl AccessControl for CalledAeTitles {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        if self.0.contains(called_ae_title.trim()) {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

enum UlCommand {
    Respond(DimseResponse, oneshot::Sender<Result<()>>),
    Abort(oneshot::Sender<()>),
}

type Event = Result<Option<DimseRequest>>;

#[async_trait]
impl AssociationAcceptor for UlAcceptor {
    async fn accept(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: &DimseConfig,
    ) -> Result<Box<dyn Association>> {
        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 {
            return Err(DimseError::ClosedBeforeNegotiation);
        }

        let socket = stream.into_std()?;
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(config.accept_timeout()))?;
        socket.set_write_timeout(non_zero(config.response_timeout()))?;
        let control = socket.try_clone()?;
        let thread_control = socket.try_clone()?;

        let (established_tx, established_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::channel(1);
        let (command_tx, command_rx) = std_mpsc::channel();
        let config = config.clone();

        tokio::task::spawn_blocking(move || {
            run_transport(
                socket,
                thread_control,
                config,
                established_tx,
                event_tx,
                command_rx,
            )
        });

        let calling_ae_title = established_rx
            .await
            .map_err(|_| DimseError::internal("transport thread exited during negotiation"))??;
        debug!(
            "Association established with {} ({})",
            calling_ae_title, peer_addr
        );

        Ok(Box::new(UlAssociation {
            calling_ae_title,
            events: event_rx,
            commands: command_tx,
            control,
            closed: false,
        }))
    }
}

/// Async handle on an association served by a transport thread
pub struct UlAssociation {
    calling_ae_title: String,
    events: mpsc::Receiver<Event>,
    commands: std_mpsc::Sender<UlCommand>,
    control: std::net::TcpStream,
    closed: bool,
}

#[async_trait]
impl Association for UlAssociation {
    fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    async fn next_request(&mut self) -> Result<Option<DimseRequest>> {
        if self.closed {
            return Ok(None);
        }
        let event = self
            .events
            .recv()
            .await
            .unwrap_or_else(|| Err(DimseError::internal("transport thread ended")));
        if !matches!(event, Ok(Some(_))) {
            self.closed = true;
        }
        event
    }

    async fn respond(&mut self, response: DimseResponse) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(UlCommand::Respond(response, done_tx))
            .map_err(|_| DimseError::internal("transport thread ended"))?;
        done_rx
            .await
            .map_err(|_| DimseError::internal("transport thread ended"))?
    }

    async fn abort(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(UlCommand::Abort(done_tx)).is_ok() {
            // the thread only sees the command between two requests
            let _ = tokio::time::timeout(ABORT_GRACE, done_rx).await;
        }
        let _ = self.control.shutdown(Shutdown::Both);
        Ok(())
    }
}

impl Drop for UlAssociation {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

/// Encode `response` and hand its P-DATA-TF PDUs to `send`
fn send_response<E: std::fmt::Display>(
    response: &DimseResponse,
    max_pdu: u32,
    mut send: impl FnMut(&Pdu) -> std::result::Result<(), E>,
) -> Result<()> {
    let bytes = message::encode_response(response)?;
    for pdv in message::fragment(
        response.presentation_context_id,
        PDataValueType::Command,
        &bytes,
        max_pdu,
    ) {
        send(&Pdu::PData { data: vec![pdv] }).map_err(DimseError::ul)?;
    }
    Ok(())
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

fn run_transport(
    socket: std::net::TcpStream,
    control: std::net::TcpStream,
    config: DimseConfig,
    established_tx: oneshot::Sender<Result<String>>,
    event_tx: mpsc::Sender<Event>,
    command_rx: std_mpsc::Receiver<UlCommand>,
) {
    let called = CalledAeTitles(config.ae_titles().into_iter().collect());
    let mut options = ServerAssociationOptions::new()
        .ae_access_control(called)
        .ae_title(config.local_aet.clone())
        .max_pdu_length(config.max_pdu_receive)
        .promiscuous(config.promiscuous);
    for uid in config.abstract_syntaxes() {
        options = options.with_abstract_syntax(uid);
    }
    for ts in &config.transfer_syntaxes {
        options = options.with_transfer_syntax(ts.clone());
    }

    let mut association = match options.establish(socket) {
        Ok(association) => association,
        Err(e) => {
            let _ = established_tx.send(Err(DimseError::AssociationRejected(e.to_string())));
            return;
        }
    };

    if let Err(e) = control.set_read_timeout(Some(config.idle_timeout())) {
        warn!("Cannot apply idle timeout to association socket: {}", e);
    }

    let transfer_syntaxes: HashMap<u8, String> = association
        .presentation_contexts()
        .iter()
        .map(|pc| (pc.id, pc.transfer_syntax.clone()))
        .collect();

    if established_tx
        .send(Ok(association.client_ae_title().to_string()))
        .is_err()
    {
        let _ = association.abort();
        return;
    }

    let mut assembler = MessageAssembler::new();
    loop {
        let pdu = match association.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                let _ = event_tx.blocking_send(Err(DimseError::ul(e)));
                return;
            }
        };

        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    let mut assembled = match assembler.push(pdv) {
                        Ok(Some(assembled)) => assembled,
                        Ok(None) => continue,
                        Err(e) => {
                            let _ = event_tx.blocking_send(Err(e));
                            let _ = association.abort();
                            return;
                        }
                    };

                    let ts = transfer_syntaxes
                        .get(&assembled.presentation_context_id)
                        .cloned()
                        .unwrap_or_default();
                    let request = match message::into_request(&mut assembled, &ts) {
                        Ok(request) => request,
                        Err(e) => match message::rejection(&assembled) {
                            Some(response) => {
                                warn!(
                                    "Refusing {} message {}: {}",
                                    response.command, response.message_id, e
                                );
                                let sent = send_response(&response, config.max_pdu_send, |pdu| {
                                    association.send(pdu)
                                });
                                if let Err(e) = sent {
                                    let _ = event_tx.blocking_send(Err(e));
                                    let _ = association.abort();
                                    return;
                                }
                                continue;
                            }
                            None => {
                                let _ = event_tx.blocking_send(Err(e));
                                let _ = association.abort();
                                return;
                            }
                        },
                    };
                    if event_tx.blocking_send(Ok(Some(request))).is_err() {
                        let _ = association.abort();
                        return;
                    }

                    match command_rx.recv() {
                        Ok(UlCommand::Respond(response, done)) => {
                            let sent = send_response(&response, config.max_pdu_send, |pdu| {
                                association.send(pdu)
                            });
                            let failed = sent.is_err();
                            let _ = done.send(sent);
                            if failed {
                                let _ = association.abort();
                                return;
                            }
                        }
                        Ok(UlCommand::Abort(done)) => {
                            let _ = association.abort();
                            let _ = done.send(());
                            return;
                        }
                        Err(_) => {
                            let _ = association.abort();
                            return;
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => {
                let _ = association.send(&Pdu::ReleaseRP);
                let _ = event_tx.blocking_send(Ok(None));
                return;
            }
            Pdu::AbortRQ { .. } => {
                let _ = event_tx.blocking_send(Err(DimseError::AssociationAborted));
                return;
            }
            other => {
                let _ = event_tx.blocking_send(Err(DimseError::UnexpectedPdu(format!(
                    "{:?}",
                    other
                ))));
                let _ = association.abort();
                return;
            }
        }
    }
}
