//! Narrow association interface between the listener and the upper layer transport
//!
//! The listener never touches PDUs. It drives an [`Association`] obtained from an
//! [`AssociationAcceptor`], which owns negotiation and message framing. The
//! production acceptor is [`crate::ul::UlAcceptor`]; tests plug in scripted ones.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::DimseConfig;
use crate::types::{DimseRequest, DimseResponse};
use crate::Result;

/// Verification SOP Class, always negotiated
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// An established association, as seen by the listener
#[async_trait]
pub trait Association: Send {
    /// AE title declared by the peer
    fn calling_ae_title(&self) -> &str;

    /// Wait for the next request. `Ok(None)` means the peer released the association.
    async fn next_request(&mut self) -> Result<Option<DimseRequest>>;

    /// Write a response for a previously received request
    async fn respond(&mut self, response: DimseResponse) -> Result<()>;

    /// Abort the association (A-ABORT). No further calls are valid afterwards.
    async fn abort(&mut self) -> Result<()>;
}

/// Negotiates associations on freshly accepted connections
#[async_trait]
pub trait AssociationAcceptor: Send + Sync {
    async fn accept(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: &DimseConfig,
    ) -> Result<Box<dyn Association>>;
}
