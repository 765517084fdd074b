//! PDU decoding.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

/// The maximum allowed length of a UID on the wire, in bytes.
const UID_MAX_LENGTH: usize = 64;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// no PDU was available: the stream was closed
    /// before the first byte of a PDU header
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("could not read PDU body"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU body was shorter than the declared length"))]
    TruncatedPdu { backtrace: Backtrace },

    #[snafu(display("unrecognized PDU type {:#04x}", pdu_type))]
    UnrecognizedPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("unrecognized PDU variable item type {:#04x}", item_type))]
    UnrecognizedVariableItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("invalid item length {} (must be >= 2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display("field `{}` is not a valid UID ({} bytes)", field, length))]
    InvalidUid {
        field: &'static str,
        length: usize,
        backtrace: Backtrace,
    },

    /// invalid reject source or reason
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    /// invalid abort source or reason
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    /// invalid presentation context result reason
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    /// invalid transfer syntax sub-item
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },

    /// unknown presentation context sub-item
    UnknownPresentationContextSubItem { backtrace: Backtrace },

    /// multiple transfer syntaxes were accepted in one presentation context
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    /// missing application context name
    MissingApplicationContextName { backtrace: Backtrace },

    /// missing abstract syntax
    MissingAbstractSyntax { backtrace: Backtrace },

    /// missing transfer syntax
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read one PDU from the given source.
///
/// `max_pdu_length` bounds the PDU body length that this node
/// is willing to receive;
/// anything larger is a protocol error.
/// Returns [`Error::NoPduAvailable`] if the stream is closed
/// before the first byte of the PDU header.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        max_pdu_length >= MINIMUM_PDU_SIZE,
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // An empty stream at this point means that the peer
    // closed the connection in between PDUs,
    // which is distinguished from a truncated PDU.
    let mut head = [0; 2];
    if let Err(e) = reader.read_exact(&mut head) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = head[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    ensure!(
        pdu_length <= max_pdu_length,
        PduTooLargeSnafu {
            pdu_length,
            max_pdu_length
        }
    );

    let body = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    ensure!(body.len() == pdu_length as usize, TruncatedPduSnafu);
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 | 0x02 => {
            // A-ASSOCIATE-RQ | A-ASSOCIATE-AC

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts_proposed = vec![];
            let mut presentation_contexts_accorded = vec![];
            let mut user_variables = vec![];

            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // reserved, sent as zero but not tested on receipt
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // called and calling AE titles: 16 characters each,
            // ISO 646 with non-significant surrounding spaces
            let mut ae_bytes = [0; 16];
            cursor
                .read_exact(&mut ae_bytes)
                .context(ReadPduFieldSnafu {
                    field: "Called-AE-title",
                })?;
            let called_ae_title = codec
                .decode(&ae_bytes)
                .context(DecodeTextSnafu {
                    field: "Called-AE-title",
                })?
                .trim()
                .to_string();

            let mut ae_bytes = [0; 16];
            cursor
                .read_exact(&mut ae_bytes)
                .context(ReadPduFieldSnafu {
                    field: "Calling-AE-title",
                })?;
            let calling_ae_title = codec
                .decode(&ae_bytes)
                .context(DecodeTextSnafu {
                    field: "Calling-AE-title",
                })?
                .trim()
                .to_string();

            // 32 reserved bytes
            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            // variable items: one application context,
            // one or more presentation contexts, one user information
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) if pdu_type == 0x01 => {
                        presentation_contexts_proposed.push(val);
                    }
                    PduVariableItem::PresentationContextResult(val) if pdu_type == 0x02 => {
                        presentation_contexts_accorded.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    item => {
                        return UnrecognizedVariableItemSnafu {
                            item_type: item.type_code(),
                        }
                        .fail();
                    }
                }
            }

            let application_context_name =
                application_context_name.context(MissingApplicationContextNameSnafu)?;

            if pdu_type == 0x01 {
                Ok(Pdu::AssociationRQ(AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: presentation_contexts_proposed,
                    user_variables,
                }))
            } else {
                Ok(Pdu::AssociationAC(AssociationAC {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: presentation_contexts_accorded,
                    user_variables,
                }))
            }
        }
        0x03 => {
            // A-ASSOCIATE-RJ: 1 reserved byte, result, source, reason

            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF: a sequence of presentation data value items
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // message control header:
                // bit 0 set for command fragments,
                // bit 1 set on the last fragment of a command or data set
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;
                ensure!(data.len() == (item_length - 2) as usize, TruncatedPduSnafu);

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ: 4 reserved bytes
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP: 4 reserved bytes
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT: 2 reserved bytes, source, reason
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => UnrecognizedPduTypeSnafu { pdu_type }.fail(),
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    Ok(result)
}

/// Read a UID value field,
/// trimming trailing padding (space or null)
/// and rejecting non-printable or over-long content.
fn read_uid<R>(reader: &mut R, length: usize, field: &'static str) -> Result<String>
where
    R: Read,
{
    ensure!(
        length <= UID_MAX_LENGTH,
        InvalidUidSnafu { field, length }
    );
    let bytes = read_n(reader, length).context(ReadPduFieldSnafu { field })?;
    ensure!(bytes.len() == length, TruncatedPduSnafu);

    let trimmed = match bytes.iter().rposition(|&b| b != b'\0' && b != b' ') {
        Some(i) => &bytes[..=i],
        None => &bytes[..0],
    };
    ensure!(
        trimmed.iter().all(|&b| (0x20..=0x7E).contains(&b)),
        InvalidUidSnafu {
            field,
            length: trimmed.len()
        }
    );

    // plain ASCII at this point, so the conversion is lossless
    Ok(String::from_utf8_lossy(trimmed).into_owned())
}

/// An intermediate representation of a variable item
/// found in an association PDU.
#[derive(Debug)]
enum PduVariableItem {
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

impl PduVariableItem {
    fn type_code(&self) -> u8 {
        match self {
            PduVariableItem::ApplicationContext(_) => 0x10,
            PduVariableItem::PresentationContextProposed(_) => 0x20,
            PduVariableItem::PresentationContextResult(_) => 0x21,
            PduVariableItem::UserVariables(_) => 0x50,
        }
    }
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    ensure!(bytes.len() == item_length as usize, TruncatedPduSnafu);
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context item: a single UID
            let val = read_uid(
                &mut cursor,
                item_length as usize,
                "Application-context-name",
            )?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context item (proposed):
            // context ID, 3 reserved bytes,
            // one abstract syntax sub-item
            // and one or more transfer syntax sub-items

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        abstract_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            ensure!(!transfer_syntaxes.is_empty(), MissingTransferSyntaxSnafu);

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context item (result):
            // context ID, reserved, result/reason, reserved,
            // exactly one transfer syntax sub-item

            let mut transfer_syntax: Option<String> = None;

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;

            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        if transfer_syntax.is_some() {
                            return MultipleTransferSyntaxesAcceptedSnafu.fail();
                        }
                        transfer_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information item: a sequence of user data sub-items

            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x51 => {
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        let implementation_class_uid = read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Implementation-class-uid",
                        )?;
                        user_variables.push(UserVariableItem::ImplementationClassUid(
                            implementation_class_uid,
                        ));
                    }
                    0x55 => {
                        let bytes =
                            read_n(&mut cursor, item_length as usize).context(ReadPduFieldSnafu {
                                field: "Implementation-version-name",
                            })?;
                        let implementation_version_name = codec
                            .decode(&bytes)
                            .context(DecodeTextSnafu {
                                field: "Implementation-version-name",
                            })?
                            .trim()
                            .to_string();
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            implementation_version_name,
                        ));
                    }
                    0x58 => {
                        // user identity negotiation
                        let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "User-Identity-type",
                        })?;

                        let positive_response_requested =
                            cursor.read_u8().context(ReadPduFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        let primary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;

                        let primary_field = read_n(&mut cursor, primary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;

                        // only non-zero when the identity type
                        // is username and passcode
                        let secondary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;

                        let secondary_field = read_n(&mut cursor, secondary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })?;

                        match UserIdentityType::from(user_identity_type) {
                            Some(user_identity_type) => {
                                user_variables.push(UserVariableItem::UserIdentityItem(
                                    UserIdentity::new(
                                        positive_response_requested == 1,
                                        user_identity_type,
                                        primary_field,
                                        secondary_field,
                                    ),
                                ));
                            }
                            None => {
                                warn!("unknown user identity type code {}", user_identity_type);
                            }
                        }
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => UnrecognizedVariableItemSnafu { item_type }.fail(),
    }
}
