//! Storage Commitment Push Model service class provider.
//!
//! The provider listens for associations,
//! receives N-ACTION commitment requests,
//! consults a [`StorageCommitmentDelegate`]
//! to decide the fate of every referenced SOP instance,
//! and reports the outcome back over the same association
//! with an N-EVENT-REPORT.
//!
//! See [`scp::StorageCommitmentServer`] for the entry point.

pub mod dataset;
pub mod scp;

use std::net::SocketAddr;

use async_trait::async_trait;

/// A reference to a single SOP instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SopReference {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
}

impl SopReference {
    pub fn new(sop_class_uid: impl Into<String>, sop_instance_uid: impl Into<String>) -> Self {
        SopReference {
            sop_class_uid: sop_class_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
        }
    }
}

/// Why a referenced SOP instance could not be committed,
/// as carried in Failure Reason (0008,1197).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// a general failure in processing the operation
    ProcessingFailure = 0x0110,
    /// the instance is not known to this application entity
    NoSuchObjectInstance = 0x0112,
    /// the instance cannot be committed for resource reasons
    ResourceLimitation = 0x0213,
    /// storage commitment is not supported for this SOP class
    ReferencedSopClassNotSupported = 0x0122,
    /// the instance does not belong to the indicated SOP class
    ClassInstanceConflict = 0x0119,
    /// the transaction UID is already in use
    DuplicateTransactionUid = 0x0131,
}

impl FailureReason {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0110 => Some(FailureReason::ProcessingFailure),
            0x0112 => Some(FailureReason::NoSuchObjectInstance),
            0x0213 => Some(FailureReason::ResourceLimitation),
            0x0122 => Some(FailureReason::ReferencedSopClassNotSupported),
            0x0119 => Some(FailureReason::ClassInstanceConflict),
            0x0131 => Some(FailureReason::DuplicateTransactionUid),
            _ => None,
        }
    }
}

/// A reference that could not be committed, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSopReference {
    pub reference: SopReference,
    pub failure_reason: FailureReason,
}

/// A storage commitment request received from an SCU:
/// a transaction UID and the instances to commit to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentRequest {
    pub transaction_uid: String,
    pub references: Vec<SopReference>,
}

/// The outcome of processing a commitment request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitmentResult {
    /// instances this node commits to keeping
    pub committed: Vec<SopReference>,
    /// instances that could not be committed
    pub failed: Vec<FailedSopReference>,
}

impl CommitmentResult {
    /// Whether every referenced instance was committed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Facts about an incoming association,
/// for the delegate to decide on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationInfo {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub peer_address: SocketAddr,
}

/// The application-side logic of a storage commitment provider.
///
/// The server calls into the delegate from the association tasks;
/// implementations must therefore be shareable across tasks.
#[async_trait]
pub trait StorageCommitmentDelegate: Send + Sync {
    /// Decide whether the association should be accepted
    /// after the AE title checks have passed.
    async fn should_accept(&self, _info: &AssociationInfo) -> bool {
        true
    }

    /// Decide the fate of every instance referenced by the request.
    async fn process_commitment_request(&self, request: &CommitmentRequest) -> CommitmentResult;
}
