//! DIMSE status codes reported for C-STORE outcomes
//!
//! Codes follow PS3.4 conventions:
//! - `0x0000`: Success
//! - `0x0110`: Processing failure (undecodable data set)
//! - `0xA700`: Out of resources (no backend stored the object)

use dimse::DimseStatus;

/// Status for a data set that could not be decoded
pub fn decode_failure_status() -> DimseStatus {
    DimseStatus::PROCESSING_FAILURE
}

/// Status for an object no storage backend accepted
pub fn unstored_status(reject_unstored: bool) -> DimseStatus {
    if reject_unstored {
        DimseStatus::OUT_OF_RESOURCES
    } else {
        DimseStatus::Success
    }
}

/// Whether the peer may reasonably retry after this status
pub fn is_retriable_status(status: &DimseStatus) -> bool {
    matches!(status, DimseStatus::Failure(0xA700..=0xA7FF))
}
