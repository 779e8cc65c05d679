//! Common types for DIMSE operations

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw dataset bytes of a transfer, still encoded in the negotiated transfer syntax
#[derive(Debug, Clone)]
pub struct DatasetStream {
    data: Bytes,
    metadata: DatasetMetadata,
}

/// Metadata associated with a received dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Unique identifier for this dataset
    pub id: Uuid,

    /// Transfer syntax UID the dataset is encoded with
    pub transfer_syntax: String,

    /// SOP Class UID (Affected SOP Class UID of the request)
    pub sop_class_uid: String,

    /// SOP Instance UID (Affected SOP Instance UID of the request)
    pub sop_instance_uid: String,

    /// Timestamp when dataset was received
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Size of the dataset in bytes
    pub size_bytes: u64,
}

/// DIMSE command types served by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimseCommand {
    /// C-ECHO command
    Echo,
    /// C-STORE command
    Store,
    /// Command the listener does not serve, keeping the peer's Command Field
    Unrecognized(u16),
}

impl DimseCommand {
    /// Command Field value of the request message
    pub fn request_field(self) -> u16 {
        match self {
            DimseCommand::Echo => 0x0030,
            DimseCommand::Store => 0x0001,
            DimseCommand::Unrecognized(field) => field,
        }
    }

    /// Command Field value of the matching response message
    pub fn response_field(self) -> u16 {
        self.request_field() | 0x8000
    }

    /// Served command for a request Command Field, `None` when it is not served
    pub fn from_request_field(field: u16) -> Option<Self> {
        match field {
            0x0030 => Some(DimseCommand::Echo),
            0x0001 => Some(DimseCommand::Store),
            _ => None,
        }
    }
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation failed with error
    Failure(u16), // DICOM status code
}

impl DimseStatus {
    pub const PROCESSING_FAILURE: DimseStatus = DimseStatus::Failure(0x0110);
    pub const OUT_OF_RESOURCES: DimseStatus = DimseStatus::Failure(0xA700);
    pub const UNRECOGNIZED_OPERATION: DimseStatus = DimseStatus::Failure(0x0211);

    /// Status code as written in the Status (0000,0900) element
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Failure(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DimseStatus::Success)
    }
}

/// An inbound request decoded from the command set of a DIMSE message
#[derive(Debug, Clone)]
pub struct DimseRequest {
    /// Unique request ID for log correlation
    pub id: Uuid,

    /// Message ID assigned by the peer
    pub message_id: u16,

    /// Presentation context the request arrived on
    pub presentation_context_id: u8,

    /// Request payload
    pub payload: DimseRequestPayload,
}

/// Payload types for DIMSE requests
#[derive(Debug, Clone)]
pub enum DimseRequestPayload {
    /// C-ECHO request
    Echo { sop_class_uid: String },

    /// C-STORE request with the dataset to store
    Store(StoreRequest),
}

/// A C-STORE request together with its dataset
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub dataset: DatasetStream,
}

/// A response to be written back on the association
#[derive(Debug, Clone)]
pub struct DimseResponse {
    pub command: DimseCommand,
    pub message_id: u16,
    pub presentation_context_id: u8,
    pub sop_class_uid: String,
    pub sop_instance_uid: Option<String>,
    pub status: DimseStatus,
}

impl DatasetStream {
    pub fn new(
        data: Bytes,
        transfer_syntax: impl Into<String>,
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
    ) -> Self {
        let metadata = DatasetMetadata {
            id: Uuid::new_v4(),
            transfer_syntax: transfer_syntax.into(),
            sop_class_uid: sop_class_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
            timestamp: chrono::Utc::now(),
            size_bytes: data.len() as u64,
        };
        Self { data, metadata }
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl DimseRequest {
    pub fn echo(message_id: u16, presentation_context_id: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            presentation_context_id,
            payload: DimseRequestPayload::Echo {
                sop_class_uid: crate::association::VERIFICATION_SOP_CLASS.to_string(),
            },
        }
    }

    pub fn store(message_id: u16, presentation_context_id: u8, request: StoreRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            presentation_context_id,
            payload: DimseRequestPayload::Store(request),
        }
    }

    pub fn command(&self) -> DimseCommand {
        match self.payload {
            DimseRequestPayload::Echo { .. } => DimseCommand::Echo,
            DimseRequestPayload::Store(_) => DimseCommand::Store,
        }
    }
}

impl DimseResponse {
    /// Build the response answering `request` with `status`
    pub fn for_request(request: &DimseRequest, status: DimseStatus) -> Self {
        let (sop_class_uid, sop_instance_uid) = match &request.payload {
            DimseRequestPayload::Echo { sop_class_uid } => (sop_class_uid.clone(), None),
            DimseRequestPayload::Store(store) => (
                store.dataset.metadata().sop_class_uid.clone(),
                Some(store.dataset.metadata().sop_instance_uid.clone()),
            ),
        };
        Self {
            command: request.command(),
            message_id: request.message_id,
            presentation_context_id: request.presentation_context_id,
            sop_class_uid,
            sop_instance_uid,
            status,
        }
    }
}

impl std::fmt::Display for DimseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseCommand::Echo => write!(f, "C-ECHO"),
            DimseCommand::Store => write!(f, "C-STORE"),
            DimseCommand::Unrecognized(field) => write!(f, "command {:#06x}", field),
        }
    }
}
