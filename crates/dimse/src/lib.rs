//! DIMSE (DICOM Message Service Element) storage listener
//!
//! This crate accepts DICOM associations and serves C-ECHO and C-STORE requests.
//! Negotiation and PDU framing are delegated to `dicom-ul`; the listener itself
//! only sees the [`Association`] interface and hands every authorized C-STORE to a
//! [`StoreProvider`].
//!
//! # Features
//! - Primary and alternative AE titles on one port with shared capabilities
//! - Per-association accept, idle and response timeouts
//! - Bounded graceful drain on shutdown

pub mod association;
pub mod config;
pub mod error;
pub mod message;
pub mod scp;
pub mod types;
pub mod ul;

// Re-export commonly used types
pub use association::{Association, AssociationAcceptor, VERIFICATION_SOP_CLASS};
pub use config::DimseConfig;
pub use error::{DimseError, Result};
pub use scp::{wait_until_ready, AssociationOutcome, DimseScp, ListenerState, StoreProvider};
pub use types::{
    DatasetStream, DimseCommand, DimseRequest, DimseRequestPayload, DimseResponse, DimseStatus,
    StoreRequest,
};
pub use ul::UlAcceptor;

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
