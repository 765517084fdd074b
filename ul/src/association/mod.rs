//! DICOM association module
//!
//! This module contains the abstractions for requesting associations
//! between DICOM application entities over TCP,
//! in the role of a service class user.
//! See [`ClientAssociationOptions`](client::ClientAssociationOptions)
//! for details and examples on how to request an association.

pub mod client;

use std::time::Duration;

use snafu::{ResultExt, Backtrace, Snafu};

use crate::machine::{AssociationEvent, AssociationState, InvalidTransition};
use crate::pdu::{AbortRQSource, AssociationRJ, Pdu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// association requires at least one presentation context
    NoPresentationContexts { backtrace: Backtrace },

    #[snafu(display("too many presentation contexts ({}), maximum is 128", count))]
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    #[snafu(display("invalid application entity title"))]
    InvalidAeTitle {
        #[snafu(backtrace)]
        source: crate::address::InvalidAeTitleError,
    },

    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("connection attempt timed out after {:?}", timeout))]
    ConnectTimeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    /// the connection was closed by the peer
    ConnectionClosed { backtrace: Backtrace },

    /// failed to send PDU bytes on the transport
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive PDU bytes from the transport
    WireRecv {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode outgoing PDU
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// received a malformed PDU
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    #[snafu(display(
        "incoming PDU of {} bytes exceeds the maximum of {}",
        pdu_length,
        max_pdu_length
    ))]
    ReceivedPduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("operation is not allowed in the current association state"))]
    InvalidState {
        source: InvalidTransition,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected PDU, expected {}: {}", expected, pdu.short_description()))]
    UnexpectedPdu {
        expected: &'static str,
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    /// the association was rejected by the peer
    #[snafu(display(
        "association rejected ({:?}, {:?})",
        association_rj.result,
        association_rj.source
    ))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("association aborted ({:?})", source_info))]
    Aborted {
        source_info: AbortRQSource,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display(
        "presentation context {} was not accepted for this association",
        presentation_context_id
    ))]
    UnacceptedPresentationContext {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    /// could not fragment message into PDUs
    Fragment {
        #[snafu(backtrace)]
        source: crate::pdata::Error,
    },

    /// the ARTIM timer expired while waiting for the peer
    ArtimExpired { backtrace: Backtrace },

    /// invalid server name for TLS session
    #[cfg(feature = "tls")]
    InvalidServerName {
        source: rustls::pki_types::InvalidDnsNameError,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of waiting for the next message
/// on an established association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A P-DATA-TF arrived, carrying presentation data values.
    Pdata(Vec<crate::pdu::PDataValue>),
    /// The peer requested an orderly release;
    /// it was answered and the association is now closed.
    Released,
}

/// Feed an event to the state machine,
/// updating `state` in place and returning the action to carry out.
pub(crate) fn advance(
    state: &mut AssociationState,
    event: AssociationEvent,
) -> Result<Option<crate::machine::Action>> {
    let transition = crate::machine::transition(*state, event).context(InvalidStateSnafu)?;
    *state = transition.state;
    Ok(transition.action)
}
