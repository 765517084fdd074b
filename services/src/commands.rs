//! DIMSE command set construction and interpretation.
//!
//! Command sets are small DICOM data sets
//! carried in the command fragments of P-DATA-TF PDUs,
//! always encoded in implicit VR little endian.
//! This module provides builders for the command messages
//! used by the verification and storage commitment services,
//! plus [`CommandSet`] for picking received commands apart.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, ReadError, WriteError};
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt, Snafu};

/// DIMSE status codes used by these services.
pub mod status {
    /// the operation completed successfully
    pub const SUCCESS: u16 = 0x0000;
    /// the requested SOP class is not supported
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    /// a general failure occurred while processing the operation
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    /// the operation is not one that the receiver supports
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not decode command set
    DecodeCommandSet { source: ReadError },

    /// could not encode command set
    EncodeCommandSet { source: WriteError },

    #[snafu(display("missing command element `{}`", name))]
    MissingCommandElement {
        name: &'static str,
        source: dicom_object::AccessError,
    },

    #[snafu(display("invalid value in command element `{}`", name))]
    InvalidCommandValue {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("unknown command field {:#06x}", code))]
    UnknownCommandField { code: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The command field codes of the DIMSE messages
/// spoken by these services.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            0x0100 => Some(CommandField::NEventReportRq),
            0x8100 => Some(CommandField::NEventReportRsp),
            0x0130 => Some(CommandField::NActionRq),
            0x8130 => Some(CommandField::NActionRsp),
            _ => None,
        }
    }
}

/// Command Data Set Type (0000,0800) values.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandDataSetType {
    Present = 0x0001,
    Absent = 0x0101,
}

/// A DIMSE command message that can be encoded for the wire.
pub trait Command {
    /// The command field code of this message.
    fn command_field(&self) -> CommandField;

    /// The message-specific elements of the command set.
    fn dataset(&self) -> InMemDicomObject;

    /// Encode the command set in implicit VR little endian,
    /// declaring whether a data set follows.
    fn encode(&self, with_dataset: bool) -> Result<Vec<u8>> {
        let mut obj = self.dataset();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.command_field() as u16]),
        ));
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if with_dataset {
                    CommandDataSetType::Present as u16
                } else {
                    CommandDataSetType::Absent as u16
                }]
            ),
        ));
        let mut buffer = Vec::new();
        obj.write_dataset_with_ts(&mut buffer, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(EncodeCommandSetSnafu)?;
        Ok(buffer)
    }
}

/// C-ECHO request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
}

impl Command for CEchoRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRq
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
        ])
    }
}

/// C-ECHO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: &'a str,
    pub status: u16,
}

impl Command for CEchoRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRsp
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
        ])
    }
}

/// N-ACTION request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NActionRq<'a> {
    pub message_id: u16,
    pub requested_sop_class_uid: &'a str,
    pub requested_sop_instance_uid: &'a str,
    pub action_type_id: u16,
}

impl Command for NActionRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NActionRq
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::REQUESTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.requested_sop_class_uid),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::REQUESTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.requested_sop_instance_uid),
            ),
            DataElement::new(
                tags::ACTION_TYPE_ID,
                VR::US,
                dicom_value!(U16, [self.action_type_id]),
            ),
        ])
    }
}

/// N-ACTION response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NActionRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub action_type_id: u16,
    pub status: u16,
}

impl Command for NActionRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NActionRsp
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_instance_uid),
            ),
            DataElement::new(
                tags::ACTION_TYPE_ID,
                VR::US,
                dicom_value!(U16, [self.action_type_id]),
            ),
        ])
    }
}

/// N-EVENT-REPORT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NEventReportRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub event_type_id: u16,
}

impl Command for NEventReportRq<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NEventReportRq
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_instance_uid),
            ),
            DataElement::new(
                tags::EVENT_TYPE_ID,
                VR::US,
                dicom_value!(U16, [self.event_type_id]),
            ),
        ])
    }
}

/// N-EVENT-REPORT response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NEventReportRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub event_type_id: u16,
    pub status: u16,
}

impl Command for NEventReportRsp<'_> {
    fn command_field(&self) -> CommandField {
        CommandField::NEventReportRsp
    }

    fn dataset(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_class_uid),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.affected_sop_instance_uid),
            ),
            DataElement::new(
                tags::EVENT_TYPE_ID,
                VR::US,
                dicom_value!(U16, [self.event_type_id]),
            ),
        ])
    }
}

/// Encode a bare failure response for an unsupported request:
/// the response command field, the message being responded to
/// and the failure status, nothing else.
pub fn error_response(request_field_code: u16, message_id: u16, status: u16) -> Result<Vec<u8>> {
    let obj = InMemDicomObject::from_element_iter(vec![
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [request_field_code | 0x8000]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [CommandDataSetType::Absent as u16]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ]);
    let mut buffer = Vec::new();
    obj.write_dataset_with_ts(&mut buffer, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(EncodeCommandSetSnafu)?;
    Ok(buffer)
}

/// A received command set, ready for interpretation.
#[derive(Debug, Clone)]
pub struct CommandSet(InMemDicomObject);

impl CommandSet {
    /// Decode a command set from its wire bytes
    /// (implicit VR little endian).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(DecodeCommandSetSnafu)
            .map(CommandSet)
    }

    /// The command field code, raw.
    pub fn command_field_code(&self) -> Result<u16> {
        self.uint16(tags::COMMAND_FIELD, "CommandField")
    }

    /// The command field, rejecting codes these services do not speak.
    pub fn command_field(&self) -> Result<CommandField> {
        let code = self.command_field_code()?;
        CommandField::from_code(code).context(UnknownCommandFieldSnafu { code })
    }

    pub fn message_id(&self) -> Result<u16> {
        self.uint16(tags::MESSAGE_ID, "MessageID")
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.uint16(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "MessageIDBeingRespondedTo",
        )
    }

    pub fn status(&self) -> Result<u16> {
        self.uint16(tags::STATUS, "Status")
    }

    pub fn action_type_id(&self) -> Result<u16> {
        self.uint16(tags::ACTION_TYPE_ID, "ActionTypeID")
    }

    pub fn event_type_id(&self) -> Result<u16> {
        self.uint16(tags::EVENT_TYPE_ID, "EventTypeID")
    }

    pub fn requested_sop_class_uid(&self) -> Result<String> {
        self.text(tags::REQUESTED_SOP_CLASS_UID, "RequestedSOPClassUID")
    }

    pub fn requested_sop_instance_uid(&self) -> Result<String> {
        self.text(tags::REQUESTED_SOP_INSTANCE_UID, "RequestedSOPInstanceUID")
    }

    pub fn affected_sop_class_uid(&self) -> Result<String> {
        self.text(tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
    }

    /// Whether the command declares an accompanying data set.
    pub fn has_dataset(&self) -> Result<bool> {
        Ok(self.uint16(tags::COMMAND_DATA_SET_TYPE, "CommandDataSetType")?
            != CommandDataSetType::Absent as u16)
    }

    fn uint16(&self, tag: dicom_core::Tag, name: &'static str) -> Result<u16> {
        self.0
            .element(tag)
            .context(MissingCommandElementSnafu { name })?
            .to_int::<u16>()
            .context(InvalidCommandValueSnafu { name })
    }

    fn text(&self, tag: dicom_core::Tag, name: &'static str) -> Result<String> {
        Ok(self
            .0
            .element(tag)
            .context(MissingCommandElementSnafu { name })?
            .to_str()
            .context(InvalidCommandValueSnafu { name })?
            .trim_end_matches('\0')
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::uids;

    #[test]
    fn echo_request_roundtrip() {
        let bytes = CEchoRq {
            message_id: 7,
            affected_sop_class_uid: uids::VERIFICATION,
        }
        .encode(false)
        .unwrap();

        let command = CommandSet::from_bytes(&bytes).unwrap();
        assert_eq!(command.command_field().unwrap(), CommandField::CEchoRq);
        assert_eq!(command.message_id().unwrap(), 7);
        assert_eq!(command.affected_sop_class_uid().unwrap(), uids::VERIFICATION);
        assert!(!command.has_dataset().unwrap());
    }

    #[test]
    fn action_request_declares_its_dataset() {
        let bytes = NActionRq {
            message_id: 1,
            requested_sop_class_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL,
            requested_sop_instance_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            action_type_id: 1,
        }
        .encode(true)
        .unwrap();

        let command = CommandSet::from_bytes(&bytes).unwrap();
        assert_eq!(command.command_field().unwrap(), CommandField::NActionRq);
        assert_eq!(
            command.requested_sop_class_uid().unwrap(),
            uids::STORAGE_COMMITMENT_PUSH_MODEL
        );
        assert_eq!(command.action_type_id().unwrap(), 1);
        assert!(command.has_dataset().unwrap());
    }

    #[test]
    fn event_report_response_roundtrip() {
        let bytes = NEventReportRsp {
            message_id_being_responded_to: 3,
            affected_sop_class_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL,
            affected_sop_instance_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            event_type_id: 1,
            status: status::SUCCESS,
        }
        .encode(false)
        .unwrap();

        let command = CommandSet::from_bytes(&bytes).unwrap();
        assert_eq!(
            command.command_field().unwrap(),
            CommandField::NEventReportRsp
        );
        assert_eq!(command.message_id_being_responded_to().unwrap(), 3);
        assert_eq!(command.event_type_id().unwrap(), 1);
        assert_eq!(command.status().unwrap(), status::SUCCESS);
    }

    #[test]
    fn error_response_carries_the_status() {
        let bytes = error_response(0x0130, 9, status::UNRECOGNIZED_OPERATION).unwrap();
        let command = CommandSet::from_bytes(&bytes).unwrap();
        assert_eq!(command.command_field_code().unwrap(), 0x8130);
        assert_eq!(command.message_id_being_responded_to().unwrap(), 9);
        assert_eq!(command.status().unwrap(), status::UNRECOGNIZED_OPERATION);
        assert!(!command.has_dataset().unwrap());
    }

    #[test]
    fn unknown_command_field_is_rejected() {
        let bytes = CEchoRq {
            message_id: 1,
            affected_sop_class_uid: uids::VERIFICATION,
        }
        .encode(false)
        .unwrap();
        let mut command = CommandSet::from_bytes(&bytes).unwrap();
        command.0.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [0x0FFF]),
        ));
        assert!(matches!(
            command.command_field(),
            Err(Error::UnknownCommandField { code: 0x0FFF })
        ));
    }
}
