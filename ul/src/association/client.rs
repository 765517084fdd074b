//! Association requestor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity requests an association
//! with another node, taking the role of a service class user (SCU).
//! See [`ClientAssociationOptions`]
//! for details and examples on how to establish an association.

use std::borrow::Cow;
use std::time::Duration;

use bytes::BytesMut;
use snafu::{ensure, ResultExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::address::{AeTitle, FullAeAddr};
use crate::machine::{AssociationEvent, AssociationState};
use crate::pdata::fragment_message;
use crate::pdu::{
    AbortRQSource, AssociationRQ, PDataValue, Pdu, PresentationContextProposed,
    PresentationContextResult, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU, MINIMUM_PDU_SIZE,
};
use crate::transport::{connect, read_pdu_from_wire, write_pdu_to_wire};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::{
    advance, AbortedSnafu, ArtimExpiredSnafu, FragmentSnafu, InvalidAeTitleSnafu,
    NoAcceptedPresentationContextsSnafu, NoPresentationContextsSnafu, Received, RejectedSnafu,
    Result, TooManyPresentationContextsSnafu, UnacceptedPresentationContextSnafu,
    UnexpectedPduSnafu,
};

/// Strip trailing padding characters from a UID.
fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with('\0') || uid.ends_with(' ') {
        uid.trim_end_matches(|c| c == '\0' || c == ' ')
            .to_string()
            .into()
    } else {
        uid
    }
}

/// A DICOM association builder for a service class user (SCU).
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
/// The outcome is a [`ClientAssociation`].
///
/// # Example
///
/// ```no_run
/// # use dicomnet_ul::association::client::ClientAssociationOptions;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = ClientAssociationOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .called_ae_title("ANY-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish("127.0.0.1:104")
///     .await?;
/// association.release().await?;
/// # Ok(())
/// # }
/// ```
///
/// When no transfer syntaxes are indicated for a presentation context,
/// _Explicit VR Little Endian_ and _Implicit VR Little Endian_
/// are proposed.
///
/// The response to the association request,
/// as well as the response to a release request,
/// is awaited under the ARTIM timer:
/// if the peer stays silent for longer than
/// the configured timeout,
/// an A-ABORT is sent on a best effort basis
/// and the operation fails with
/// [`ArtimExpired`](super::Error::ArtimExpired).
/// Call [`no_artim_timeout`](Self::no_artim_timeout)
/// to wait indefinitely instead.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    /// the requested application context name
    application_context_name: Cow<'static, str>,
    /// the proposed presentation contexts:
    /// abstract syntax plus explicit transfer syntaxes
    /// (empty list meaning the default candidates)
    presentation_contexts: Vec<(Cow<'static, str>, Vec<Cow<'static, str>>)>,
    /// the default transfer syntax candidates
    /// for contexts proposed without any
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length that this node is willing to receive
    max_pdu_length: u32,
    /// the timeout for establishing the TCP connection
    connect_timeout: Option<Duration>,
    /// the ARTIM timeout guarding association and release responses
    artim_timeout: Option<Duration>,
    /// user identity to provide to the peer
    user_identity: Option<UserIdentity>,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            connect_timeout: Some(Duration::from_secs(30)),
            artim_timeout: Some(Duration::from_secs(30)),
            user_identity: None,
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context with this abstract syntax
    /// and the default transfer syntax candidates.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), Vec::new()));
        self
    }

    /// Propose a presentation context with this abstract syntax
    /// and an explicit list of transfer syntax candidates,
    /// in order of preference.
    pub fn with_presentation_context<T, I, U>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: I,
    ) -> Self
    where
        T: Into<Cow<'static, str>>,
        I: IntoIterator<Item = U>,
        U: Into<Cow<'static, str>>,
    {
        self.presentation_contexts.push((
            trim_uid(abstract_syntax_uid.into()),
            transfer_syntax_uids
                .into_iter()
                .map(|uid| trim_uid(uid.into()))
                .collect(),
        ));
        self
    }

    /// Add this transfer syntax to the default candidates
    /// proposed with every context
    /// that does not bring its own list.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the maximum PDU length
    /// that this application entity is willing to receive.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override the timeout for establishing the TCP connection.
    ///
    /// The default is 30 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Override the ARTIM timeout,
    /// which guards the waits for association and release responses.
    ///
    /// The default is 30 seconds.
    pub fn artim_timeout(mut self, timeout: Duration) -> Self {
        self.artim_timeout = Some(timeout);
        self
    }

    /// Disarm the ARTIM timer:
    /// waits for association and release responses
    /// block until the peer answers or the connection is lost.
    pub fn no_artim_timeout(mut self) -> Self {
        self.artim_timeout = None;
        self
    }

    /// Provide a user identity to the peer
    /// as part of the association request.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Connect to the given address
    /// and request a new DICOM association.
    pub async fn establish<A>(self, address: A) -> Result<ClientAssociation<TcpStream>>
    where
        A: tokio::net::ToSocketAddrs,
    {
        self.validate()?;
        let socket = connect(address, self.connect_timeout).await?;
        self.establish_on(socket).await
    }

    /// Check the options before anything reaches the network.
    fn validate(&self) -> Result<()> {
        AeTitle::new(self.calling_ae_title.as_ref()).context(InvalidAeTitleSnafu)?;
        AeTitle::new(self.called_ae_title.as_ref()).context(InvalidAeTitleSnafu)?;
        ensure!(
            !self.presentation_contexts.is_empty(),
            NoPresentationContextsSnafu
        );
        ensure!(
            self.presentation_contexts.len() <= 128,
            TooManyPresentationContextsSnafu {
                count: self.presentation_contexts.len()
            }
        );
        Ok(())
    }

    /// Connect to the application entity at the given full address,
    /// using its AE title as the called AE title.
    pub async fn establish_with(
        self,
        address: &FullAeAddr,
    ) -> Result<ClientAssociation<TcpStream>> {
        let called = address.ae_title().as_str().to_string();
        self.called_ae_title(called)
            .establish(address.socket_addr())
            .await
    }

    /// Connect to the given address over TLS
    /// and request a new DICOM association.
    #[cfg(feature = "tls")]
    pub async fn establish_tls<A>(
        self,
        address: A,
        tls_config: std::sync::Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<ClientAssociation<crate::transport::TlsStream>>
    where
        A: tokio::net::ToSocketAddrs,
    {
        self.validate()?;
        let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .context(super::InvalidServerNameSnafu)?;
        let socket =
            crate::transport::connect_tls(address, self.connect_timeout, tls_config, server_name)
                .await?;
        self.establish_on(socket).await
    }

    /// Negotiate an association over an already connected stream.
    async fn establish_on<S>(self, mut socket: S) -> Result<ClientAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            mut transfer_syntax_uids,
            protocol_version,
            max_pdu_length,
            connect_timeout: _,
            artim_timeout,
            user_identity,
        } = self;

        // reject bad input before anything reaches the wire
        let calling_ae_title = AeTitle::new(calling_ae_title.as_ref())
            .context(InvalidAeTitleSnafu)?;
        let called_ae_title = AeTitle::new(called_ae_title.as_ref())
            .context(InvalidAeTitleSnafu)?;
        ensure!(
            !presentation_contexts.is_empty(),
            NoPresentationContextsSnafu
        );
        ensure!(
            presentation_contexts.len() <= 128,
            TooManyPresentationContextsSnafu {
                count: presentation_contexts.len()
            }
        );

        if transfer_syntax_uids.is_empty() {
            // Explicit VR Little Endian
            transfer_syntax_uids.push("1.2.840.10008.1.2.1".into());
            // Implicit VR Little Endian
            transfer_syntax_uids.push("1.2.840.10008.1.2".into());
        }

        // presentation context identifiers are odd and unique
        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| {
                let transfer_syntaxes = if transfer_syntaxes.is_empty() {
                    transfer_syntax_uids
                        .iter()
                        .map(|uid| uid.to_string())
                        .collect()
                } else {
                    transfer_syntaxes
                        .into_iter()
                        .map(|uid| uid.to_string())
                        .collect()
                };
                PresentationContextProposed {
                    id: (2 * i + 1) as u8,
                    abstract_syntax: abstract_syntax.to_string(),
                    transfer_syntaxes,
                }
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some(user_identity) = user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(user_identity));
        }

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.as_str().to_string(),
            called_ae_title: called_ae_title.as_str().to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts,
            user_variables,
        });

        let mut state = AssociationState::Idle;
        advance(&mut state, AssociationEvent::TransportConnected)?;

        let mut write_buffer: Vec<u8> = Vec::with_capacity(max_pdu_length as usize);
        let mut read_buffer = BytesMut::with_capacity(max_pdu_length as usize);

        write_pdu_to_wire(&mut socket, &mut write_buffer, &msg).await?;
        advance(&mut state, AssociationEvent::AssociateRequestSent)?;

        // the association response is awaited under ARTIM
        let receiving = read_pdu_from_wire(&mut socket, &mut read_buffer, max_pdu_length);
        let msg = match artim_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiving).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    abort_on_artim(&mut socket, &mut write_buffer, &mut state).await;
                    return ArtimExpiredSnafu.fail();
                }
            },
            None => receiving.await,
        }?;

        match msg {
            Pdu::AssociationAC(ac) => {
                advance(&mut state, AssociationEvent::AssociateAcceptReceived)?;

                if !ac.presentation_contexts.iter().any(|pc| pc.is_accepted()) {
                    // nothing was negotiated; this association is useless
                    let abort = Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    };
                    let _ = write_pdu_to_wire(&mut socket, &mut write_buffer, &abort).await;
                    let _ = socket.shutdown().await;
                    advance(&mut state, AssociationEvent::AbortSent)?;
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                let peer_max_pdu_length = ac
                    .user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);
                // zero means unlimited
                let peer_max_pdu_length = if peer_max_pdu_length == 0 {
                    u32::MAX
                } else {
                    peer_max_pdu_length
                };
                let negotiated_max_pdu_length =
                    max_pdu_length.min(peer_max_pdu_length).max(MINIMUM_PDU_SIZE);

                debug!(
                    contexts = ac
                        .presentation_contexts
                        .iter()
                        .filter(|pc| pc.is_accepted())
                        .count(),
                    max_pdu_length = negotiated_max_pdu_length,
                    "association established"
                );

                Ok(ClientAssociation {
                    state,
                    presentation_contexts: ac.presentation_contexts,
                    max_pdu_length,
                    negotiated_max_pdu_length,
                    artim_timeout,
                    socket,
                    read_buffer,
                    write_buffer,
                })
            }
            Pdu::AssociationRJ(association_rj) => {
                advance(&mut state, AssociationEvent::AssociateRejectReceived)?;
                let _ = socket.shutdown().await;
                RejectedSnafu { association_rj }.fail()
            }
            Pdu::AbortRQ { source } => {
                advance(&mut state, AssociationEvent::AbortReceived)?;
                let _ = socket.shutdown().await;
                AbortedSnafu {
                    source_info: source,
                }
                .fail()
            }
            pdu => {
                let abort = Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        crate::pdu::AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                };
                let _ = write_pdu_to_wire(&mut socket, &mut write_buffer, &abort).await;
                let _ = socket.shutdown().await;
                advance(&mut state, AssociationEvent::AbortSent)?;
                UnexpectedPduSnafu {
                    expected: "A-ASSOCIATE-AC",
                    pdu: Box::new(pdu),
                }
                .fail()
            }
        }
    }
}

/// Best-effort A-ABORT after an ARTIM expiry:
/// the abort is emitted and the transport closed
/// regardless of write failures.
async fn abort_on_artim<S>(
    socket: &mut S,
    write_buffer: &mut Vec<u8>,
    state: &mut AssociationState,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    warn!("ARTIM timer expired, aborting association");
    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(
            crate::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
        ),
    };
    let _ = write_pdu_to_wire(socket, write_buffer, &abort).await;
    let _ = socket.shutdown().await;
    if let Ok(transition) =
        crate::machine::transition(*state, AssociationEvent::ArtimTimerExpired)
    {
        *state = transition.state;
    }
}

/// A DICOM upper level association from the perspective
/// of a requesting application entity.
///
/// The primary operations on an established association are
/// [`send_message`](Self::send_message),
/// [`send_pdata`](Self::send_pdata)
/// and [`receive`](Self::receive),
/// followed by [`release`](Self::release)
/// (or [`abort`](Self::abort)) to terminate it.
/// Every operation is checked against the association state machine;
/// an operation that is not legal in the current state
/// fails with [`InvalidState`](super::Error::InvalidState)
/// without touching the wire.
#[derive(Debug)]
pub struct ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// The current association state
    state: AssociationState,
    /// The negotiation outcome for each proposed presentation context
    presentation_contexts: Vec<PresentationContextResult>,
    /// The maximum PDU length that this node is willing to receive
    max_pdu_length: u32,
    /// The maximum PDU length accorded for sending,
    /// the minimum of both nodes' proposals
    negotiated_max_pdu_length: u32,
    /// The ARTIM timeout guarding release responses
    artim_timeout: Option<Duration>,
    /// The stream to the other DICOM node
    socket: S,
    /// Read buffer reused across receives
    read_buffer: BytesMut,
    /// Write buffer reused across sends
    write_buffer: Vec<u8>,
}

impl<S> ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        &self.presentation_contexts
    }

    /// Obtain the accepted presentation contexts only.
    pub fn accepted_presentation_contexts(
        &self,
    ) -> impl Iterator<Item = &PresentationContextResult> {
        self.presentation_contexts
            .iter()
            .filter(|pc| pc.is_accepted())
    }

    /// The maximum PDU length accorded for this association:
    /// the minimum of both nodes' proposals, never below 4096.
    pub fn negotiated_max_pdu_length(&self) -> u32 {
        self.negotiated_max_pdu_length
    }

    /// The current state of the association state machine.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// Send a DIMSE message on the given presentation context,
    /// fragmenting the command and data set
    /// across P-DATA-TF PDUs as needed.
    pub async fn send_message(
        &mut self,
        presentation_context_id: u8,
        command: &[u8],
        dataset: Option<&[u8]>,
    ) -> Result<()> {
        let pdus = fragment_message(
            presentation_context_id,
            command,
            dataset,
            self.negotiated_max_pdu_length,
        )
        .context(FragmentSnafu)?;
        for pdu in &pdus {
            self.send(pdu).await?;
        }
        Ok(())
    }

    /// Send a single P-DATA-TF PDU carrying the given fragments.
    pub async fn send_pdata(&mut self, pdvs: Vec<PDataValue>) -> Result<()> {
        let pdu = Pdu::PData { data: pdvs };
        self.send(&pdu).await
    }

    /// Send one P-DATA-TF PDU.
    ///
    /// Only legal in the established state;
    /// every fragment must ride on an accepted presentation context.
    pub async fn send(&mut self, pdu: &Pdu) -> Result<()> {
        if let Pdu::PData { data } = pdu {
            for pdv in data {
                ensure!(
                    self.is_accepted(pdv.presentation_context_id),
                    UnacceptedPresentationContextSnafu {
                        presentation_context_id: pdv.presentation_context_id
                    }
                );
            }
        }
        advance(&mut self.state, AssociationEvent::DataTransferSent)?;
        let outcome =
            write_pdu_to_wire(&mut self.socket, &mut self.write_buffer, pdu).await;
        if outcome.is_err() {
            let _ = advance(&mut self.state, AssociationEvent::TransportConnectionClosed);
        }
        outcome
    }

    /// Wait for the next message from the peer.
    ///
    /// P-DATA-TF PDUs are handed to the caller;
    /// a release request from the peer is answered and
    /// reported as [`Received::Released`];
    /// an abort surfaces as [`Aborted`](super::Error::Aborted).
    pub async fn receive(&mut self) -> Result<Received> {
        // receiving is only meaningful while established;
        // probe the machine without consuming the event
        crate::machine::transition(self.state, AssociationEvent::DataTransferReceived)
            .context(super::InvalidStateSnafu)?;

        let pdu = match read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.max_pdu_length,
        )
        .await
        {
            Ok(pdu) => pdu,
            Err(e) => {
                let _ = advance(&mut self.state, AssociationEvent::TransportConnectionClosed);
                return Err(e);
            }
        };

        match pdu {
            Pdu::PData { data } => {
                advance(&mut self.state, AssociationEvent::DataTransferReceived)?;
                Ok(Received::Pdata(data))
            }
            Pdu::ReleaseRQ => {
                // the peer wants out: answer and close
                advance(&mut self.state, AssociationEvent::ReleaseRequestReceived)?;
                let outcome = write_pdu_to_wire(
                    &mut self.socket,
                    &mut self.write_buffer,
                    &Pdu::ReleaseRP,
                )
                .await;
                let _ = self.socket.shutdown().await;
                let _ = advance(&mut self.state, AssociationEvent::TransportConnectionClosed);
                outcome?;
                Ok(Received::Released)
            }
            Pdu::AbortRQ { source } => {
                advance(&mut self.state, AssociationEvent::AbortReceived)?;
                let _ = self.socket.shutdown().await;
                AbortedSnafu {
                    source_info: source,
                }
                .fail()
            }
            pdu => {
                self.emit_abort_and_close().await;
                UnexpectedPduSnafu {
                    expected: "P-DATA-TF",
                    pdu: Box::new(pdu),
                }
                .fail()
            }
        }
    }

    /// Gracefully release the association.
    ///
    /// The release response is awaited under the ARTIM timer.
    /// A release collision
    /// (the peer requested release at the same time)
    /// is answered with an A-RELEASE-RP and treated as success.
    pub async fn release(&mut self) -> Result<()> {
        advance(&mut self.state, AssociationEvent::LocalReleaseRequest)?;
        write_pdu_to_wire(&mut self.socket, &mut self.write_buffer, &Pdu::ReleaseRQ).await?;

        loop {
            let receiving = read_pdu_from_wire(
                &mut self.socket,
                &mut self.read_buffer,
                self.max_pdu_length,
            );
            let pdu = match self.artim_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, receiving).await {
                    Ok(outcome) => outcome?,
                    Err(_) => {
                        let Self {
                            socket,
                            write_buffer,
                            state,
                            ..
                        } = self;
                        abort_on_artim(socket, write_buffer, state).await;
                        return ArtimExpiredSnafu.fail();
                    }
                },
                None => receiving.await?,
            };

            match pdu {
                Pdu::ReleaseRP => {
                    advance(&mut self.state, AssociationEvent::ReleaseResponseReceived)?;
                    let _ = self.socket.shutdown().await;
                    return Ok(());
                }
                Pdu::ReleaseRQ => {
                    // release collision: answer the peer and close
                    advance(&mut self.state, AssociationEvent::ReleaseRequestReceived)?;
                    let outcome = write_pdu_to_wire(
                        &mut self.socket,
                        &mut self.write_buffer,
                        &Pdu::ReleaseRP,
                    )
                    .await;
                    let _ = self.socket.shutdown().await;
                    return outcome;
                }
                Pdu::PData { .. } => {
                    // data that was already in flight when we asked to
                    // release; it can no longer be answered
                    debug!("dropping P-DATA-TF received while releasing");
                    continue;
                }
                Pdu::AbortRQ { source } => {
                    advance(&mut self.state, AssociationEvent::AbortReceived)?;
                    let _ = self.socket.shutdown().await;
                    return AbortedSnafu {
                        source_info: source,
                    }
                    .fail();
                }
                pdu => {
                    self.emit_abort_and_close().await;
                    return UnexpectedPduSnafu {
                        expected: "A-RELEASE-RP",
                        pdu: Box::new(pdu),
                    }
                    .fail();
                }
            }
        }
    }

    /// Abort the association:
    /// emit an A-ABORT on a best effort basis
    /// and close the transport.
    pub async fn abort(&mut self) -> Result<()> {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        let outcome =
            write_pdu_to_wire(&mut self.socket, &mut self.write_buffer, &pdu).await;
        let _ = self.socket.shutdown().await;
        if !self.state.is_terminal() {
            advance(&mut self.state, AssociationEvent::AbortSent)?;
        }
        outcome
    }

    fn is_accepted(&self, presentation_context_id: u8) -> bool {
        self.presentation_contexts
            .iter()
            .any(|pc| pc.id == presentation_context_id && pc.is_accepted())
    }

    async fn emit_abort_and_close(&mut self) {
        let abort = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                crate::pdu::AbortRQServiceProviderReason::UnexpectedPdu,
            ),
        };
        let _ = write_pdu_to_wire(&mut self.socket, &mut self.write_buffer, &abort).await;
        let _ = self.socket.shutdown().await;
        let _ = advance(&mut self.state, AssociationEvent::AbortSent);
    }
}
