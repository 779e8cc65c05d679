//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM UL error: {0}")]
    DicomUl(String),

    #[error("Connection closed before association negotiation")]
    ClosedBeforeNegotiation,

    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    #[error("Association aborted by peer")]
    AssociationAborted,

    #[error("Unexpected PDU: {0}")]
    UnexpectedPdu(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new upper layer error
    pub fn ul(msg: impl std::fmt::Display) -> Self {
        Self::DicomUl(msg.to_string())
    }

    /// Check if this error only concerns the current association
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::Timeout(_)
                | DimseError::ClosedBeforeNegotiation
                | DimseError::AssociationRejected(_)
                | DimseError::AssociationAborted
                | DimseError::UnexpectedPdu(_)
                | DimseError::DicomParsing(_)
                | DimseError::DicomUl(_)
        )
    }
}
