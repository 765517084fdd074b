//! DICOM service classes over the upper layer protocol.
//!
//! This crate builds two service classes
//! on top of [`dicomnet_ul`]:
//!
//! - the [`verification`] module is a C-ECHO service class user,
//!   for probing the reachability of a DICOM node;
//! - the [`commitment`] module is a Storage Commitment Push Model
//!   service class provider,
//!   answering N-ACTION commitment requests
//!   and reporting outcomes through N-EVENT-REPORT
//!   on the same association.
//!
//! The [`commands`] module carries the DIMSE command set codec
//! shared by both.

pub mod commands;
pub mod commitment;
pub mod verification;

pub use commitment::scp::{
    ScpEvent, StorageCommitmentHandle, StorageCommitmentOptions, StorageCommitmentServer,
};
pub use commitment::{
    AssociationInfo, CommitmentRequest, CommitmentResult, FailedSopReference, FailureReason,
    SopReference, StorageCommitmentDelegate,
};
pub use verification::{VerificationResult, VerificationScu};
