//! PDU encoding.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("could not write chunk `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(backtrace)]
        source: WriteChunkError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("failed to build chunk"))]
    BuildChunk {
        #[snafu(backtrace)]
        source: Box<Error>,
    },
    #[snafu(display("failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Write a length-prefixed chunk with a 4-byte big endian length.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write a length-prefixed chunk with a 2-byte big endian length.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write an AE title field as exactly 16 bytes,
/// space padded.
fn write_ae_title(
    writer: &mut Vec<u8>,
    ae_title: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    ae_title_bytes.resize(16, b' ');
    writer.write_all(&ae_title_bytes).context(WriteFieldSnafu { field })
}

/// Encode one PDU onto the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // PDU-type 01H + reserved byte
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // PDU-type 02H + reserved byte
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // the AE title fields of the AC are formally reserved,
                // echoed back from the request
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })?;

            Ok(())
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // PDU-type 03H + reserved byte
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(WriteFieldSnafu { field: "Result" })?;

                let (source_code, reason_code) = match source {
                    AssociationRJSource::ServiceUser(reason) => (
                        0x01,
                        match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                                0x02
                            }
                            AssociationRJServiceUserReason::CallingAeTitleNotRecognized => 0x03,
                            AssociationRJServiceUserReason::CalledAeTitleNotRecognized => 0x07,
                            AssociationRJServiceUserReason::Reserved(code) => *code,
                        },
                    ),
                    AssociationRJSource::ServiceProviderAcse(reason) => (
                        0x02,
                        match reason {
                            AssociationRJServiceProviderAcseReason::NoReasonGiven => 0x01,
                            AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => {
                                0x02
                            }
                        },
                    ),
                    AssociationRJSource::ServiceProviderPresentation(reason) => (
                        0x03,
                        match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                0x01
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                                0x02
                            }
                            AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
                        },
                    ),
                };
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer
                    .write_u8(reason_code)
                    .context(WriteFieldSnafu {
                        field: "Reason/Diag.",
                    })?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            // PDU-type 04H + reserved byte
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                for pdv in data {
                    write_chunk_u32(writer, |writer| {
                        writer.push(pdv.presentation_context_id);

                        // message control header:
                        // bit 0 set for command fragments,
                        // bit 1 set on the last fragment
                        let mut message_header = match pdv.value_type {
                            PDataValueType::Command => 0x01,
                            PDataValueType::Data => 0x00,
                        };
                        if pdv.is_last {
                            message_header |= 0x02;
                        }
                        writer.push(message_header);

                        writer.write_all(&pdv.data).context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })?;

                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value Item",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })?;

            Ok(())
        }
        Pdu::ReleaseRQ => {
            // PDU-type 05H + reserved byte + 4 reserved body bytes
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "PDU-length" })?;
            writer
                .write_u32::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        }
        Pdu::ReleaseRP => {
            // PDU-type 06H + reserved byte + 4 reserved body bytes
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            writer
                .write_u32::<BigEndian>(4)
                .context(WriteFieldSnafu { field: "PDU-length" })?;
            writer
                .write_u32::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        }
        Pdu::AbortRQ { source } => {
            // PDU-type 07H + reserved byte
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                let (source_code, reason_code) = match source {
                    AbortRQSource::ServiceUser => (0x00, 0x00),
                    AbortRQSource::Reserved => (0x01, 0x00),
                    AbortRQSource::ServiceProvider(reason) => (
                        0x02,
                        match reason {
                            AbortRQServiceProviderReason::ReasonNotSpecified => 0x00,
                            AbortRQServiceProviderReason::UnrecognizedPdu => 0x01,
                            AbortRQServiceProviderReason::UnexpectedPdu => 0x02,
                            AbortRQServiceProviderReason::Reserved => 0x03,
                            AbortRQServiceProviderReason::UnrecognizedPduParameter => 0x04,
                            AbortRQServiceProviderReason::UnexpectedPduParameter => 0x05,
                            AbortRQServiceProviderReason::InvalidPduParameter => 0x06,
                        },
                    ),
                };
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer
                    .write_u8(reason_code)
                    .context(WriteFieldSnafu {
                        field: "Reason/Diag",
                    })?;

                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;

            Ok(())
        }
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut Vec<u8>,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Application Context item: type 10H
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        let bytes = codec
            .encode(application_context_name)
            .context(EncodeFieldSnafu {
                field: "Application-context-name",
            })?;
        writer.write_all(&bytes).context(WriteFieldSnafu {
            field: "Application-context-name",
        })?;
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut Vec<u8>,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Presentation Context item (proposed): type 20H
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer.push(presentation_context.id);
        writer
            .write_all(&[0x00; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // Abstract Syntax sub-item: type 30H
        writer
            .write_u8(0x30)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        write_chunk_u16(writer, |writer| {
            let bytes = codec
                .encode(&presentation_context.abstract_syntax)
                .context(EncodeFieldSnafu {
                    field: "Abstract-syntax-name",
                })?;
            writer.write_all(&bytes).context(WriteFieldSnafu {
                field: "Abstract-syntax-name",
            })?;
            Ok(())
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax Sub-item",
        })?;

        // one Transfer Syntax sub-item (type 40H) per candidate
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer
                .write_u8(0x40)
                .context(WriteFieldSnafu { field: "Item-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            write_chunk_u16(writer, |writer| {
                let bytes = codec.encode(transfer_syntax).context(EncodeFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;
                writer.write_all(&bytes).context(WriteFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "Transfer Syntax Sub-item",
            })?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut Vec<u8>,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Presentation Context item (result): type 21H
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer.push(presentation_context.id);
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        writer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // exactly one Transfer Syntax sub-item (type 40H)
        writer
            .write_u8(0x40)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        write_chunk_u16(writer, |writer| {
            let bytes = codec
                .encode(&presentation_context.transfer_syntax)
                .context(EncodeFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;
            writer.write_all(&bytes).context(WriteFieldSnafu {
                field: "Transfer-syntax-name",
            })?;
            Ok(())
        })
        .context(WriteChunkSnafu {
            name: "Transfer Syntax Sub-item",
        })?;

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_user_variables(
    writer: &mut Vec<u8>,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // User Information item: type 50H
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    // Maximum Length sub-item: type 51H
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum Length Sub-item",
                    })?;
                }
                UserVariableItem::ImplementationClassUid(uid) => {
                    // Implementation Class UID sub-item: type 52H
                    writer
                        .write_u8(0x52)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        let bytes = codec.encode(uid).context(EncodeFieldSnafu {
                            field: "Implementation-class-uid",
                        })?;
                        writer.write_all(&bytes).context(WriteFieldSnafu {
                            field: "Implementation-class-uid",
                        })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Class UID Sub-item",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    // Implementation Version Name sub-item: type 55H
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        let bytes = codec.encode(name).context(EncodeFieldSnafu {
                            field: "Implementation-version-name",
                        })?;
                        writer.write_all(&bytes).context(WriteFieldSnafu {
                            field: "Implementation-version-name",
                        })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Version Name Sub-item",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    // User Identity sub-item: type 58H
                    writer
                        .write_u8(0x58)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u8(user_identity.identity_type() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(user_identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.primary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.primary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.secondary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.secondary_field())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity Sub-item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(data)
                            .context(WriteFieldSnafu { field: "Unknown" })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Unknown Sub-item",
                    })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "User Information Item",
    })?;

    Ok(())
}
