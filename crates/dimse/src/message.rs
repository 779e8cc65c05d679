//! DIMSE message framing over P-DATA values
//!
//! Command sets are always encoded in Implicit VR Little Endian. Datasets stay in
//! the transfer syntax negotiated for their presentation context and are handed
//! over as raw bytes.

use bytes::Bytes;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_ul::pdu::{PDataValue, PDataValueType};

use crate::types::{
    DatasetStream, DimseCommand, DimseRequest, DimseResponse, DimseStatus, StoreRequest,
};
use crate::{DimseError, Result};

/// Command Data Set Type value meaning "no dataset follows"
pub const NO_DATA_SET: u16 = 0x0101;

/// Bytes of a P-DATA-TF variable field taken by one PDV item header
const PDV_HEADER_LEN: u32 = 6;

/// A complete DIMSE message, command set decoded, dataset still raw
#[derive(Debug)]
pub struct AssembledMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub data: Option<Vec<u8>>,
}

/// Accumulates PDV fragments until a whole message is available
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command_bytes: Vec<u8>,
    command: Option<InMemDicomObject>,
    expects_data: bool,
    data: Vec<u8>,
    data_complete: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one PDV. Returns the message once its last fragment arrived.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<AssembledMessage>> {
        match self.presentation_context_id {
            Some(id) if id != pdv.presentation_context_id => {
                return Err(DimseError::UnexpectedPdu(format!(
                    "PDV for presentation context {} interleaved with context {}",
                    pdv.presentation_context_id, id
                )));
            }
            _ => self.presentation_context_id = Some(pdv.presentation_context_id),
        }

        match pdv.value_type {
            PDataValueType::Command => {
                if self.command.is_some() {
                    return Err(DimseError::UnexpectedPdu(
                        "command fragment after a complete command set".into(),
                    ));
                }
                self.command_bytes.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    let command = parse_command(&self.command_bytes)?;
                    self.expects_data = command
                        .element(tags::COMMAND_DATA_SET_TYPE)
                        .ok()
                        .and_then(|e| e.to_int::<u16>().ok())
                        .map(|t| t != NO_DATA_SET)
                        .unwrap_or(false);
                    self.command = Some(command);
                }
            }
            PDataValueType::Data => {
                if self.command.is_none() {
                    return Err(DimseError::UnexpectedPdu(
                        "data fragment before the command set".into(),
                    ));
                }
                self.data.extend_from_slice(&pdv.data);
                self.data_complete = pdv.is_last;
            }
        }

        let complete = match self.command {
            Some(_) => !self.expects_data || self.data_complete,
            None => false,
        };
        if !complete {
            return Ok(None);
        }

        let finished = std::mem::take(self);
        let presentation_context_id = finished.presentation_context_id.unwrap_or_default();
        Ok(finished.command.map(|command| AssembledMessage {
            presentation_context_id,
            command,
            data: finished.expects_data.then_some(finished.data),
        }))
    }
}

/// Decode a command set
pub fn parse_command(bytes: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomParsing(format!("Invalid command set: {}", e)))
}

fn read_u16(command: &InMemDicomObject, tag: Tag) -> Result<u16> {
    command
        .element(tag)
        .map_err(|e| DimseError::DicomParsing(format!("Missing {}: {}", tag, e)))?
        .to_int::<u16>()
        .map_err(|e| DimseError::DicomParsing(format!("Invalid {}: {}", tag, e)))
}

fn read_string(command: &InMemDicomObject, tag: Tag) -> Option<String> {
    command
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())
}

/// Turn an assembled message into a request
///
/// `transfer_syntax` is the syntax negotiated for the message's presentation context.
/// The data set is taken out of `message`; the command set stays in place so a
/// failed message can still be answered with [`rejection`].
pub fn into_request(message: &mut AssembledMessage, transfer_syntax: &str) -> Result<DimseRequest> {
    let command = &message.command;
    let field = read_u16(command, tags::COMMAND_FIELD)?;
    let message_id = read_u16(command, tags::MESSAGE_ID)?;

    match DimseCommand::from_request_field(field) {
        Some(DimseCommand::Echo) => Ok(DimseRequest::echo(
            message_id,
            message.presentation_context_id,
        )),
        Some(DimseCommand::Store) => {
            let sop_class_uid = read_string(command, tags::AFFECTED_SOP_CLASS_UID)
                .ok_or_else(|| DimseError::DicomParsing("C-STORE without SOP class".into()))?;
            let sop_instance_uid = read_string(command, tags::AFFECTED_SOP_INSTANCE_UID)
                .ok_or_else(|| {
                    DimseError::DicomParsing("C-STORE without SOP instance".into())
                })?;
            let data = message.data.take().unwrap_or_default();

            Ok(DimseRequest::store(
                message_id,
                message.presentation_context_id,
                StoreRequest {
                    dataset: DatasetStream::new(
                        Bytes::from(data),
                        transfer_syntax,
                        sop_class_uid,
                        sop_instance_uid,
                    ),
                },
            ))
        }
        Some(DimseCommand::Unrecognized(_)) | None => Err(DimseError::NotSupported(format!(
            "command field {:#06x}",
            field
        ))),
    }
}

/// Failure response for a message [`into_request`] refused
///
/// Unserved commands get `0x0211`, a C-STORE with an incomplete command set gets
/// `0x0110`. Returns `None` when the message cannot be addressed because its
/// Message ID or Command Field is unreadable.
pub fn rejection(message: &AssembledMessage) -> Option<DimseResponse> {
    let command = &message.command;
    let field = read_u16(command, tags::COMMAND_FIELD).ok()?;
    let message_id = read_u16(command, tags::MESSAGE_ID).ok()?;

    let (command_kind, status) = match DimseCommand::from_request_field(field) {
        Some(served) => (served, DimseStatus::PROCESSING_FAILURE),
        None => (
            DimseCommand::Unrecognized(field),
            DimseStatus::UNRECOGNIZED_OPERATION,
        ),
    };
    Some(DimseResponse {
        command: command_kind,
        message_id,
        presentation_context_id: message.presentation_context_id,
        sop_class_uid: read_string(command, tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default(),
        sop_instance_uid: read_string(command, tags::AFFECTED_SOP_INSTANCE_UID),
        status,
    })
}

/// Encode a response command set
pub fn encode_response(response: &DimseResponse) -> Result<Vec<u8>> {
    let mut elements = vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(response.sop_class_uid.as_str()),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [response.command.response_field()]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [response.message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(
            tags::STATUS,
            VR::US,
            dicom_value!(U16, [response.status.code()]),
        ),
    ];
    if let Some(uid) = &response.sop_instance_uid {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(uid.as_str()),
        ));
    }

    let command = InMemDicomObject::command_from_element_iter(elements);
    let mut bytes = Vec::new();
    command
        .write_dataset_with_ts(&mut bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomParsing(format!("Cannot encode response: {}", e)))?;
    Ok(bytes)
}

/// Split a command or dataset into PDVs that each fit one P-DATA-TF of `max_pdu` bytes
pub fn fragment(
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    max_pdu: u32,
) -> Vec<PDataValue> {
    let chunk = max_pdu.saturating_sub(PDV_HEADER_LEN).max(1) as usize;
    if bytes.is_empty() {
        return vec![PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: Vec::new(),
        }];
    }
    let count = bytes.len().div_ceil(chunk);
    bytes
        .chunks(chunk)
        .enumerate()
        .map(|(i, part)| PDataValue {
            presentation_context_id,
            value_type: value_type.clone(),
            is_last: i + 1 == count,
            data: part.to_vec(),
        })
        .collect()
}
