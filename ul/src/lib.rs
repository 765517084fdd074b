//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! - The [`address`] module
//!   provides validated application entity titles
//!   and compound addresses for nodes in a DICOM network.
//! - The [`pdu`] module
//!   provides the data structures representing _protocol data units_
//!   and their binary codec.
//! - The [`machine`] module
//!   holds the pure association state machine
//!   that governs which protocol events are legal at any moment.
//! - The [`pdata`] module
//!   splits DIMSE messages into presentation data value fragments
//!   and reassembles them.
//! - The [`association`] module
//!   ties the codec, the state machine and the transport together
//!   for the service class user side.
//! - The [`breaker`] module
//!   provides per-endpoint circuit breakers
//!   to keep a flapping peer from dragging its callers down.
//!
//! All association operations are asynchronous
//! and driven by the Tokio runtime.
//!
//! ## Features
//! * `tls`: enables associations over TLS
//!   via `rustls` and `tokio-rustls`.

pub mod address;
pub mod association;
pub mod breaker;
pub mod machine;
pub mod pdata;
pub mod pdu;
pub mod transport;

/// The registered port for DICOM upper layer associations.
pub const DEFAULT_DICOM_PORT: u16 = 104;

/// The implementation class UID advertised by this crate,
/// generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.316293631457733437334058944238913834";

/// The implementation version name advertised by this crate.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOMNET-UL-010";

// re-exports

pub use address::{AeTitle, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::Received;
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use machine::{transition, AssociationEvent, AssociationState};
pub use pdata::{fragment_message, AssembledMessage, MessageAssembler};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
