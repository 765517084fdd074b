//! Protocol data unit module
//!
//! This module contains the data structures
//! representing the protocol data units (PDUs)
//! exchanged between DICOM application entities
//! over the upper layer protocol,
//! plus the facilities for encoding and decoding them
//! ([`write_pdu`](writer::write_pdu), [`read_pdu`](reader::read_pdu)).

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The length of the header of a single presentation data value item:
/// item length (4 bytes), presentation context ID (1 byte)
/// and message control header (1 byte).
pub const PDV_HEADER_SIZE: u32 = 6;

/// A presentation context proposed by an association requestor:
/// one abstract syntax paired with
/// one or more transfer syntaxes in order of preference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number between 1 and 255
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of negotiating a single presentation context,
/// as carried in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresentationContextResult {
    /// the presentation context identifier from the proposal
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the accorded transfer syntax UID
    /// (only significant when the context was accepted)
    pub transfer_syntax: String,
}

impl PresentationContextResult {
    /// Whether the acceptor accorded this presentation context.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// The reason code of a negotiated presentation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an association rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJResult {
    /// rejected-permanent
    Permanent,
    /// rejected-transient
    Transient,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source (and respective reason) of an association rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJSource {
    /// DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// DICOM UL service-provider (ACSE related function)
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    /// DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAeTitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
            )),
            (1, reason) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(reason),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, reason) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(reason),
            )),
            _ => None,
        }
    }
}

/// Rejection reasons attributed to the UL service-user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

/// Rejection reasons attributed to the UL service-provider
/// (ACSE related function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

/// Rejection reasons attributed to the UL service-provider
/// (presentation related function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A single presentation data value item of a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PDataValue {
    /// the identifier of the presentation context this fragment rides on
    pub presentation_context_id: u8,
    /// whether this fragment carries command or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment of the command or data set
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of content carried by a presentation data value fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source (and respective reason) of an association abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortRQSource {
    /// DICOM UL service-user initiated abort
    ServiceUser,
    /// DICOM UL service-provider initiated abort
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }
}

/// Abort reasons attributed to the UL service-provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortRQServiceProviderReason {
    /// reason-not-specified
    ReasonNotSpecified,
    /// unrecognized-PDU
    UnrecognizedPdu,
    /// unexpected-PDU
    UnexpectedPdu,
    Reserved,
    /// unrecognized-PDU parameter
    UnrecognizedPduParameter,
    /// unexpected-PDU parameter
    UnexpectedPduParameter,
    /// invalid-PDU-parameter value
    InvalidPduParameter,
}

/// The kind of user identity provided in an association request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserIdentityType {
    /// username as a UTF-8 string
    Username = 1,
    /// username as a UTF-8 string and passcode
    UsernamePassword = 2,
    /// Kerberos service ticket
    KerberosServiceTicket = 3,
    /// SAML assertion
    SamlAssertion = 4,
    /// JSON web token
    Jwt = 5,
}

impl UserIdentityType {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }
}

/// A user identity negotiation sub-item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    /// The secondary field, only significant
    /// when the identity type is username and passcode.
    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// A sub-item of the user information item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserVariableItem {
    /// maximum length receivable by the emitter, in bytes
    MaxLength(u32),
    /// the implementation class UID of the emitter
    ImplementationClassUid(String),
    /// the implementation version name of the emitter
    ImplementationVersionName(String),
    /// user identity negotiation
    UserIdentityItem(UserIdentity),
    /// an unrecognized sub-item, kept as raw bytes
    Unknown(u8, Vec<u8>),
}

/// An A-ASSOCIATE-RQ PDU body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An A-ASSOCIATE-AC PDU body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An A-ASSOCIATE-RJ PDU body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// A DICOM upper layer protocol data unit.
///
/// Each variant carries the fields of the respective PDU type.
/// Unrecognized PDU types are decoding errors,
/// upon which the association must be aborted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (type 0x01)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (type 0x02)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (type 0x03)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (type 0x04)
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ (type 0x05)
    ReleaseRQ,
    /// A-RELEASE-RP (type 0x06)
    ReleaseRP,
    /// A-ABORT (type 0x07)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// A short description of the PDU, for logging purposes.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::AssociationRQ(AssociationRQ {
                calling_ae_title,
                called_ae_title,
                presentation_contexts,
                ..
            }) => {
                write!(
                    f,
                    "A-ASSOCIATE-RQ [{} -> {}] ({} presentation contexts)",
                    calling_ae_title,
                    called_ae_title,
                    presentation_contexts.len()
                )
            }
            Pdu::AssociationAC(AssociationAC {
                presentation_contexts,
                ..
            }) => {
                write!(
                    f,
                    "A-ASSOCIATE-AC ({} presentation contexts)",
                    presentation_contexts.len()
                )
            }
            Pdu::AssociationRJ(AssociationRJ { result, source }) => {
                write!(f, "A-ASSOCIATE-RJ ({:?}, {:?})", result, source)
            }
            Pdu::PData { data } => {
                let total: usize = data.iter().map(|pdv| pdv.data.len()).sum();
                write!(f, "P-DATA-TF ({} PDVs, {} bytes)", data.len(), total)
            }
            Pdu::ReleaseRQ => f.write_str("A-RELEASE-RQ"),
            Pdu::ReleaseRP => f.write_str("A-RELEASE-RP"),
            Pdu::AbortRQ { source } => write!(f, "A-ABORT ({:?})", source),
        }
    }
}
