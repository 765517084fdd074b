//! DIMSE message fragmentation and reassembly.
//!
//! A DIMSE message is a command set,
//! optionally followed by a data set,
//! carried as presentation data value fragments
//! inside one or more P-DATA-TF PDUs.
//! [`fragment_message`] splits the two byte streams
//! into PDUs bounded by the negotiated maximum PDU size,
//! and [`MessageAssembler`] rebuilds complete messages
//! from fragments in arrival order.

use snafu::{ensure, Backtrace, OptionExt, Snafu};

use crate::pdu::{
    PDataValue, PDataValueType, Pdu, PDU_HEADER_SIZE, PDV_HEADER_SIZE,
};

/// Command Data Set Type (0000,0800) value
/// indicating that no data set is present.
const DATA_SET_TYPE_NULL: u16 = 0x0101;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "maximum PDU length {} cannot carry any fragment payload",
        max_pdu_length
    ))]
    InsufficientMaxPduLength {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "fragment arrived on unaccepted presentation context {}",
        presentation_context_id
    ))]
    UnacceptedPresentationContext {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "data set fragment on context {} before the command set was complete",
        presentation_context_id
    ))]
    DatasetBeforeCommand {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "command fragment on context {} while awaiting the data set",
        presentation_context_id
    ))]
    UnexpectedCommandFragment {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "fragment on context {} interleaved with message on context {}",
        received,
        current
    ))]
    InterleavedPresentationContexts {
        current: u8,
        received: u8,
        backtrace: Backtrace,
    },

    /// command set fragment stream could not be interpreted
    MalformedCommandSet { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A complete DIMSE message reassembled from its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the command set bytes (implicit VR little endian)
    pub command: Vec<u8>,
    /// the data set bytes, when the command declared one
    pub dataset: Option<Vec<u8>>,
}

/// Split a DIMSE message into P-DATA-TF PDUs.
///
/// The command set is fragmented first,
/// then the data set (if any);
/// each fragment payload is bounded by
/// `max_pdu_length` minus the PDU and PDV headers,
/// and consecutive fragments share a PDU when they fit.
pub fn fragment_message(
    presentation_context_id: u8,
    command: &[u8],
    dataset: Option<&[u8]>,
    max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    let max_payload = max_pdu_length
        .saturating_sub(PDU_HEADER_SIZE)
        .saturating_sub(PDV_HEADER_SIZE) as usize;
    ensure!(
        max_payload > 0,
        InsufficientMaxPduLengthSnafu { max_pdu_length }
    );

    let mut pdvs = Vec::new();
    fragment_stream(
        &mut pdvs,
        presentation_context_id,
        command,
        PDataValueType::Command,
        max_payload,
    );
    if let Some(dataset) = dataset {
        fragment_stream(
            &mut pdvs,
            presentation_context_id,
            dataset,
            PDataValueType::Data,
            max_payload,
        );
    }

    // pack consecutive fragments into common PDUs where they fit
    let capacity = (max_pdu_length - PDU_HEADER_SIZE) as usize;
    let mut pdus = Vec::new();
    let mut current: Vec<PDataValue> = Vec::new();
    let mut current_len = 0usize;
    for pdv in pdvs {
        let pdv_len = pdv.data.len() + PDV_HEADER_SIZE as usize;
        if !current.is_empty() && current_len + pdv_len > capacity {
            pdus.push(Pdu::PData {
                data: std::mem::take(&mut current),
            });
            current_len = 0;
        }
        current_len += pdv_len;
        current.push(pdv);
    }
    if !current.is_empty() {
        pdus.push(Pdu::PData { data: current });
    }

    Ok(pdus)
}

fn fragment_stream(
    pdvs: &mut Vec<PDataValue>,
    presentation_context_id: u8,
    data: &[u8],
    value_type: PDataValueType,
    max_payload: usize,
) {
    if data.is_empty() {
        pdvs.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: Vec::new(),
        });
        return;
    }

    let mut chunks = data.chunks(max_payload).peekable();
    while let Some(chunk) = chunks.next() {
        pdvs.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: chunks.peek().is_none(),
            data: chunk.to_vec(),
        });
    }
}

/// Whether a complete command set declares an accompanying data set,
/// read from its Command Data Set Type (0000,0800) element.
///
/// Command sets are always encoded in implicit VR little endian.
pub fn command_expects_dataset(command: &[u8]) -> Result<bool> {
    let mut pos = 0usize;
    while pos + 8 <= command.len() {
        let group = u16::from_le_bytes([command[pos], command[pos + 1]]);
        let element = u16::from_le_bytes([command[pos + 2], command[pos + 3]]);
        let length = u32::from_le_bytes([
            command[pos + 4],
            command[pos + 5],
            command[pos + 6],
            command[pos + 7],
        ]) as usize;
        pos += 8;

        if group == 0x0000 && element == 0x0800 {
            ensure!(length >= 2 && pos + 2 <= command.len(), MalformedCommandSetSnafu);
            let value = u16::from_le_bytes([command[pos], command[pos + 1]]);
            return Ok(value != DATA_SET_TYPE_NULL);
        }

        pos = pos.checked_add(length).context(MalformedCommandSetSnafu)?;
    }
    MalformedCommandSetSnafu.fail()
}

#[derive(Debug)]
struct InFlight {
    presentation_context_id: u8,
    command: Vec<u8>,
    command_complete: bool,
    dataset: Vec<u8>,
}

/// A stateful reassembler of DIMSE messages, one per association.
///
/// Fragments are pushed in arrival order;
/// a complete message is emitted once
/// the last fragment of the command set
/// (and of the data set, when the command declares one)
/// has been seen.
#[derive(Debug)]
pub struct MessageAssembler {
    accepted_presentation_contexts: Vec<u8>,
    in_flight: Option<InFlight>,
}

impl MessageAssembler {
    /// Create an assembler for an association
    /// with the given accepted presentation context identifiers.
    pub fn new<I>(accepted_presentation_contexts: I) -> Self
    where
        I: IntoIterator<Item = u8>,
    {
        MessageAssembler {
            accepted_presentation_contexts: accepted_presentation_contexts.into_iter().collect(),
            in_flight: None,
        }
    }

    /// Feed one presentation data value fragment.
    ///
    /// Returns a message once its final fragment arrives.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<AssembledMessage>> {
        let id = pdv.presentation_context_id;
        ensure!(
            self.accepted_presentation_contexts.contains(&id),
            UnacceptedPresentationContextSnafu {
                presentation_context_id: id
            }
        );

        let mut message = match self.in_flight.take() {
            None => {
                ensure!(
                    pdv.value_type == PDataValueType::Command,
                    DatasetBeforeCommandSnafu {
                        presentation_context_id: id
                    }
                );
                InFlight {
                    presentation_context_id: id,
                    command: Vec::new(),
                    command_complete: false,
                    dataset: Vec::new(),
                }
            }
            Some(message) => {
                ensure!(
                    message.presentation_context_id == id,
                    InterleavedPresentationContextsSnafu {
                        current: message.presentation_context_id,
                        received: id
                    }
                );
                message
            }
        };

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(
                    !message.command_complete,
                    UnexpectedCommandFragmentSnafu {
                        presentation_context_id: id
                    }
                );
                message.command.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    if command_expects_dataset(&message.command)? {
                        message.command_complete = true;
                        self.in_flight = Some(message);
                    } else {
                        return Ok(Some(AssembledMessage {
                            presentation_context_id: id,
                            command: message.command,
                            dataset: None,
                        }));
                    }
                } else {
                    self.in_flight = Some(message);
                }
            }
            PDataValueType::Data => {
                ensure!(
                    message.command_complete,
                    DatasetBeforeCommandSnafu {
                        presentation_context_id: id
                    }
                );
                message.dataset.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    return Ok(Some(AssembledMessage {
                        presentation_context_id: id,
                        command: message.command,
                        dataset: Some(message.dataset),
                    }));
                } else {
                    self.in_flight = Some(message);
                }
            }
        }

        Ok(None)
    }
}
