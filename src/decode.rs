//! Turning received bytes and stored files into DICOM objects

use crate::storage::DicomFile;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dimse::DatasetStream;
use std::io::{Cursor, Read};
use thiserror::Error;

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Empty data set")]
    Empty,

    #[error("Unsupported transfer syntax {0}")]
    UnsupportedTransferSyntax(String),

    #[error("Malformed data set: {0}")]
    Malformed(String),

    #[error("Invalid file meta group: {0}")]
    Meta(String),

    #[error("Not a DICOM file")]
    NotDicom,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trimmed string value of an element, `None` when absent or blank
pub fn element_text(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Decode the data set of a C-STORE request and attach a file meta group
pub fn decode_dataset(dataset: &DatasetStream) -> Result<DicomFile, DecodeError> {
    if dataset.is_empty() {
        return Err(DecodeError::Empty);
    }

    let meta = dataset.metadata();
    let ts = TransferSyntaxRegistry
        .get(&meta.transfer_syntax)
        .ok_or_else(|| DecodeError::UnsupportedTransferSyntax(meta.transfer_syntax.clone()))?;

    let object = InMemDicomObject::read_dataset_with_ts(&dataset.bytes()[..], ts)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(meta.transfer_syntax.as_str())
                .media_storage_sop_class_uid(meta.sop_class_uid.as_str())
                .media_storage_sop_instance_uid(meta.sop_instance_uid.as_str()),
        )
        .map_err(|e| DecodeError::Meta(e.to_string()))
}

/// Read a DICOM file up to (not including) its pixel data.
///
/// Accepts files with or without the 128-byte preamble.
pub fn read_header(mut reader: impl Read) -> Result<DicomFile, DecodeError> {
    let mut head = Vec::with_capacity(PREAMBLE_LEN + MAGIC.len());
    (&mut reader)
        .take((PREAMBLE_LEN + MAGIC.len()) as u64)
        .read_to_end(&mut head)?;

    let start = if head.len() == PREAMBLE_LEN + MAGIC.len() && &head[PREAMBLE_LEN..] == MAGIC {
        PREAMBLE_LEN
    } else if head.starts_with(MAGIC) {
        0
    } else {
        return Err(DecodeError::NotDicom);
    };

    let source = Cursor::new(head.split_off(start)).chain(reader);
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .from_reader(source)
        .map_err(|e| DecodeError::Malformed(e.to_string()))
}
