//! Construction and interpretation of the storage commitment data sets.
//!
//! Only the elements of the push model service are handled:
//! Transaction UID (0008,1195),
//! Referenced SOP Sequence (0008,1199),
//! Failed SOP Sequence (0008,1198)
//! and their item attributes.
//! Everything else in a data set is carried and ignored.

use dicom_core::{dicom_value, value::DataSetSequence, DataElement, Length, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{mem::InMemElement, InMemDicomObject, ReadError, WriteError};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{OptionExt, ResultExt, Snafu};

use super::{CommitmentRequest, FailedSopReference, SopReference};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("transfer syntax `{}` is not supported", uid))]
    UnsupportedTransferSyntax { uid: String },

    /// could not decode data set
    DecodeDataset { source: ReadError },

    /// could not encode data set
    EncodeDataset { source: WriteError },

    #[snafu(display("missing attribute `{}`", name))]
    MissingAttribute {
        name: &'static str,
        source: dicom_object::AccessError,
    },

    #[snafu(display("invalid value in attribute `{}`", name))]
    InvalidAttributeValue {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("attribute `{}` is not a sequence", name))]
    NotASequence { name: &'static str },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn text(obj: &InMemDicomObject, tag: dicom_core::Tag, name: &'static str) -> Result<String> {
    Ok(obj
        .element(tag)
        .context(MissingAttributeSnafu { name })?
        .to_str()
        .context(InvalidAttributeValueSnafu { name })?
        .trim_end_matches('\0')
        .to_string())
}

/// Decode the action information data set of a commitment request,
/// encoded in the given transfer syntax.
pub fn read_action_info(data: &[u8], transfer_syntax_uid: &str) -> Result<CommitmentRequest> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    let obj = InMemDicomObject::read_dataset_with_ts(data, ts).context(DecodeDatasetSnafu)?;

    let transaction_uid = text(&obj, tags::TRANSACTION_UID, "TransactionUID")?;

    let sequence = obj
        .element(tags::REFERENCED_SOP_SEQUENCE)
        .context(MissingAttributeSnafu {
            name: "ReferencedSOPSequence",
        })?;
    let items = sequence.items().context(NotASequenceSnafu {
        name: "ReferencedSOPSequence",
    })?;

    let mut references = Vec::with_capacity(items.len());
    for item in items {
        references.push(SopReference {
            sop_class_uid: text(item, tags::REFERENCED_SOP_CLASS_UID, "ReferencedSOPClassUID")?,
            sop_instance_uid: text(
                item,
                tags::REFERENCED_SOP_INSTANCE_UID,
                "ReferencedSOPInstanceUID",
            )?,
        });
    }

    Ok(CommitmentRequest {
        transaction_uid,
        references,
    })
}

fn sop_item(reference: &SopReference) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(vec![
        DataElement::new(
            tags::REFERENCED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, &reference.sop_class_uid),
        ),
        DataElement::new(
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, &reference.sop_instance_uid),
        ),
    ])
}

fn sop_sequence(tag: dicom_core::Tag, items: Vec<InMemDicomObject>) -> InMemElement {
    DataElement::new(
        tag,
        VR::SQ,
        DataSetSequence::new(items, Length::UNDEFINED),
    )
}

/// Build the action information data set of a commitment request.
pub fn action_info_dataset(request: &CommitmentRequest) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(vec![
        DataElement::new(
            tags::TRANSACTION_UID,
            VR::UI,
            dicom_value!(Str, &request.transaction_uid),
        ),
        sop_sequence(
            tags::REFERENCED_SOP_SEQUENCE,
            request.references.iter().map(sop_item).collect(),
        ),
    ])
}

/// Build the event information data set of a commitment result,
/// with the committed instances in the Referenced SOP Sequence
/// and the failures in the Failed SOP Sequence.
pub fn event_report_dataset(
    transaction_uid: &str,
    committed: &[SopReference],
    failed: &[FailedSopReference],
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::TRANSACTION_UID,
        VR::UI,
        dicom_value!(Str, transaction_uid),
    ));
    if !committed.is_empty() {
        obj.put(sop_sequence(
            tags::REFERENCED_SOP_SEQUENCE,
            committed.iter().map(sop_item).collect(),
        ));
    }
    if !failed.is_empty() {
        obj.put(sop_sequence(
            tags::FAILED_SOP_SEQUENCE,
            failed
                .iter()
                .map(|failure| {
                    let mut item = sop_item(&failure.reference);
                    item.put(DataElement::new(
                        tags::FAILURE_REASON,
                        VR::US,
                        dicom_value!(U16, [failure.failure_reason.code()]),
                    ));
                    item
                })
                .collect(),
        ));
    }
    obj
}

/// Interpret an event information data set
/// back into committed and failed references.
pub fn read_event_info(
    data: &[u8],
    transfer_syntax_uid: &str,
) -> Result<(String, Vec<SopReference>, Vec<FailedSopReference>)> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    let obj = InMemDicomObject::read_dataset_with_ts(data, ts).context(DecodeDatasetSnafu)?;

    let transaction_uid = text(&obj, tags::TRANSACTION_UID, "TransactionUID")?;

    let mut committed = Vec::new();
    if let Ok(sequence) = obj.element(tags::REFERENCED_SOP_SEQUENCE) {
        let items = sequence.items().context(NotASequenceSnafu {
            name: "ReferencedSOPSequence",
        })?;
        for item in items {
            committed.push(SopReference {
                sop_class_uid: text(item, tags::REFERENCED_SOP_CLASS_UID, "ReferencedSOPClassUID")?,
                sop_instance_uid: text(
                    item,
                    tags::REFERENCED_SOP_INSTANCE_UID,
                    "ReferencedSOPInstanceUID",
                )?,
            });
        }
    }

    let mut failed = Vec::new();
    if let Ok(sequence) = obj.element(tags::FAILED_SOP_SEQUENCE) {
        let items = sequence.items().context(NotASequenceSnafu {
            name: "FailedSOPSequence",
        })?;
        for item in items {
            let code = item
                .element(tags::FAILURE_REASON)
                .context(MissingAttributeSnafu {
                    name: "FailureReason",
                })?
                .to_int::<u16>()
                .context(InvalidAttributeValueSnafu {
                    name: "FailureReason",
                })?;
            failed.push(FailedSopReference {
                reference: SopReference {
                    sop_class_uid: text(
                        item,
                        tags::REFERENCED_SOP_CLASS_UID,
                        "ReferencedSOPClassUID",
                    )?,
                    sop_instance_uid: text(
                        item,
                        tags::REFERENCED_SOP_INSTANCE_UID,
                        "ReferencedSOPInstanceUID",
                    )?,
                },
                failure_reason: super::FailureReason::from_code(code)
                    .unwrap_or(super::FailureReason::ProcessingFailure),
            });
        }
    }

    Ok((transaction_uid, committed, failed))
}

/// Encode a data set in the given transfer syntax.
pub fn write_dataset(obj: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    let mut buffer = Vec::new();
    obj.write_dataset_with_ts(&mut buffer, ts)
        .context(EncodeDatasetSnafu)?;
    Ok(buffer)
}
