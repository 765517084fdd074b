//! The Storage Commitment Push Model server.
//!
//! A listener task accepts TCP connections
//! up to the configured concurrency bound,
//! handing each one to its own association task.
//! The association task negotiates the association,
//! answers N-ACTION commitment requests,
//! and issues the N-EVENT-REPORT with the outcome
//! on the same association,
//! waiting for its response before taking the next message.
//! Lifecycle observations are published on an event channel.

use std::borrow::Cow;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dicom_dictionary_std::uids;
use dicomnet_ul::pdata::{fragment_message, AssembledMessage, MessageAssembler};
use dicomnet_ul::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJServiceProviderAcseReason, AssociationRJSource, AssociationRQ, Pdu,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
    AbortRQServiceProviderReason, AbortRQSource, DEFAULT_MAX_PDU, MINIMUM_PDU_SIZE,
};
use dicomnet_ul::transport::{read_pdu_from_wire, write_pdu_to_wire};
use dicomnet_ul::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use crate::commands::{
    self, status, CommandField, CommandSet, NActionRsp, NEventReportRq, Command,
};
use crate::commitment::{dataset, AssociationInfo, CommitmentRequest, StorageCommitmentDelegate};

/// Transfer syntaxes this provider is willing to negotiate,
/// in no particular order; the requestor's proposal order decides.
const SUPPORTED_TRANSFER_SYNTAXES: [&str; 2] = [
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
];

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not bind the listener socket
    Bind { source: std::io::Error },

    /// transport or protocol failure on the association
    Association {
        source: dicomnet_ul::association::Error,
    },

    /// fragment reassembly failed
    Assemble {
        source: dicomnet_ul::pdata::Error,
    },

    /// DIMSE command codec failure
    Command { source: crate::commands::Error },

    /// commitment data set codec failure
    Dataset {
        source: crate::commitment::dataset::Error,
    },

    #[snafu(display("unexpected {}", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu> },

    #[snafu(display("unexpected DIMSE command {:#06x}", code))]
    UnexpectedCommand { code: u16 },

    #[snafu(display("commitment delegate failed: {}", detail))]
    DelegateFailed { detail: String },

    #[snafu(display("no transfer syntax accorded for presentation context {}", id))]
    NoTransferSyntax { id: u8 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Settings for a storage commitment provider.
#[derive(Debug, Clone)]
pub struct StorageCommitmentOptions {
    /// the AE title of this provider
    ae_title: Cow<'static, str>,
    /// the port to listen on
    port: u16,
    /// the maximum PDU length this provider is willing to receive
    max_pdu_length: u32,
    /// how many associations may run at the same time;
    /// connections beyond the bound are dropped on arrival
    max_concurrent_associations: usize,
    /// when set, only these calling AE titles are admitted
    calling_ae_whitelist: Option<HashSet<String>>,
    /// calling AE titles that are never admitted;
    /// takes precedence over the whitelist
    calling_ae_blacklist: Option<HashSet<String>>,
}

impl Default for StorageCommitmentOptions {
    fn default() -> Self {
        StorageCommitmentOptions {
            ae_title: "COMMIT-SCP".into(),
            port: 11112,
            max_pdu_length: DEFAULT_MAX_PDU,
            max_concurrent_associations: 10,
            calling_ae_whitelist: None,
            calling_ae_blacklist: None,
        }
    }
}

impl StorageCommitmentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title of this provider.
    ///
    /// The default is `COMMIT-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Define the port to listen on. The default is 11112.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the maximum PDU length
    /// this provider is willing to receive.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Bound the number of simultaneously running associations;
    /// at least one.
    pub fn max_concurrent_associations(mut self, value: usize) -> Self {
        self.max_concurrent_associations = value.max(1);
        self
    }

    /// Admit only this calling AE title
    /// (and any other explicitly allowed one).
    pub fn allow_calling_ae(mut self, ae_title: impl Into<String>) -> Self {
        self.calling_ae_whitelist
            .get_or_insert_with(HashSet::new)
            .insert(ae_title.into());
        self
    }

    /// Never admit this calling AE title,
    /// even when it is on the whitelist.
    pub fn deny_calling_ae(mut self, ae_title: impl Into<String>) -> Self {
        self.calling_ae_blacklist
            .get_or_insert_with(HashSet::new)
            .insert(ae_title.into());
        self
    }

    fn admits_calling_ae(&self, calling_ae_title: &str) -> bool {
        if let Some(blacklist) = &self.calling_ae_blacklist {
            if blacklist.contains(calling_ae_title) {
                return false;
            }
        }
        match &self.calling_ae_whitelist {
            Some(whitelist) => whitelist.contains(calling_ae_title),
            None => true,
        }
    }
}

/// A lifecycle observation from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpEvent {
    /// The listener is up.
    Started { address: SocketAddr },
    /// The listener stopped.
    Stopped,
    /// An association was negotiated and is ready for commands.
    AssociationEstablished {
        calling_ae_title: String,
        peer_address: SocketAddr,
    },
    /// An association ended through an orderly release.
    AssociationReleased { calling_ae_title: String },
    /// An association request was turned down.
    AssociationRejected {
        calling_ae_title: String,
        rejection: AssociationRJ,
    },
    /// A commitment request arrived and was understood.
    CommitmentRequestReceived {
        transaction_uid: String,
        reference_count: usize,
    },
    /// The outcome of a commitment request was reported
    /// back to the requester.
    CommitmentResultSent {
        transaction_uid: String,
        success: bool,
    },
    /// Something went wrong while serving an association.
    Error { detail: String },
}

/// A storage commitment provider, ready to start.
pub struct StorageCommitmentServer {
    options: StorageCommitmentOptions,
    delegate: Arc<dyn StorageCommitmentDelegate>,
}

impl StorageCommitmentServer {
    pub fn new(
        options: StorageCommitmentOptions,
        delegate: Arc<dyn StorageCommitmentDelegate>,
    ) -> Self {
        StorageCommitmentServer { options, delegate }
    }

    /// Bind the listener and start serving associations in the background.
    pub async fn start(self) -> Result<StorageCommitmentHandle> {
        let StorageCommitmentServer { options, delegate } = self;

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, options.port))
            .await
            .context(BindSnafu)?;
        let address = listener.local_addr().context(BindSnafu)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(%address, ae_title = %options.ae_title, "storage commitment provider listening");
        let _ = events_tx.send(ScpEvent::Started { address });

        let task = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(options.max_concurrent_associations));
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let (socket, peer_address) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                warn!("could not accept connection: {}", e);
                                continue;
                            }
                        };
                        let permit = match permits.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                // over the concurrency bound
                                warn!(%peer_address, "dropping connection, association limit reached");
                                drop(socket);
                                continue;
                            }
                        };
                        let task = AssociationTask {
                            socket,
                            peer_address,
                            options: options.clone(),
                            delegate: delegate.clone(),
                            events: events_tx.clone(),
                            read_buffer: BytesMut::with_capacity(options.max_pdu_length as usize),
                            write_buffer: Vec::with_capacity(options.max_pdu_length as usize),
                            calling_ae_title: String::new(),
                            send_max_pdu_length: options.max_pdu_length,
                            contexts: Vec::new(),
                            next_message_id: 1,
                        };
                        let events = events_tx.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = task.run().await {
                                let detail = snafu::Report::from_error(&e).to_string();
                                warn!(%peer_address, "association failed: {}", detail);
                                let _ = events.send(ScpEvent::Error { detail });
                            }
                        });
                    }
                }
            }
            let _ = events_tx.send(ScpEvent::Stopped);
        });

        Ok(StorageCommitmentHandle {
            address,
            events: events_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A handle to a running storage commitment provider.
pub struct StorageCommitmentHandle {
    address: SocketAddr,
    events: mpsc::UnboundedReceiver<ScpEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StorageCommitmentHandle {
    /// The address the provider is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Wait for the next lifecycle event.
    ///
    /// Returns `None` once the provider has stopped
    /// and all pending events were drained.
    pub async fn next_event(&mut self) -> Option<ScpEvent> {
        self.events.recv().await
    }

    /// Stop accepting connections and wait for the listener to wind down.
    /// Running associations are not interrupted.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

enum LoopControl {
    Continue,
    Closed,
}

struct AssociationTask {
    socket: TcpStream,
    peer_address: SocketAddr,
    options: StorageCommitmentOptions,
    delegate: Arc<dyn StorageCommitmentDelegate>,
    events: mpsc::UnboundedSender<ScpEvent>,
    read_buffer: BytesMut,
    write_buffer: Vec<u8>,
    calling_ae_title: String,
    /// the maximum PDU length accorded for sending
    send_max_pdu_length: u32,
    /// accepted presentation contexts: identifier and transfer syntax
    contexts: Vec<(u8, String)>,
    next_message_id: u16,
}

impl AssociationTask {
    async fn run(mut self) -> Result<()> {
        if !self.negotiate().await? {
            return Ok(());
        }
        self.serve().await
    }

    async fn send(&mut self, pdu: &Pdu) -> Result<()> {
        write_pdu_to_wire(&mut self.socket, &mut self.write_buffer, pdu)
            .await
            .context(AssociationSnafu)
    }

    async fn receive(&mut self) -> dicomnet_ul::association::Result<Pdu> {
        read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.options.max_pdu_length,
        )
        .await
    }

    /// Answer the association request:
    /// `Ok(true)` when the association is established,
    /// `Ok(false)` when it was rejected or dropped.
    async fn negotiate(&mut self) -> Result<bool> {
        let pdu = match self.receive().await {
            Ok(pdu) => pdu,
            Err(dicomnet_ul::association::Error::ConnectionClosed { .. }) => {
                debug!(peer = %self.peer_address, "connection closed before association request");
                return Ok(false);
            }
            Err(e) => return Err(e).context(AssociationSnafu),
        };

        let rq = match pdu {
            Pdu::AssociationRQ(rq) => rq,
            pdu => {
                self.abort_unexpected().await;
                return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
        };

        self.calling_ae_title = rq.calling_ae_title.clone();

        if let Some(reason) = self.rejection_reason(&rq).await {
            let rejection = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(reason),
            };
            self.send(&Pdu::AssociationRJ(rejection)).await?;
            let _ = self.events.send(ScpEvent::AssociationRejected {
                calling_ae_title: rq.calling_ae_title,
                rejection,
            });
            self.close().await;
            return Ok(false);
        }

        let (results, accepted) = negotiate_presentation_contexts(&rq);
        if accepted.is_empty() {
            let rejection = AssociationRJ {
                result: AssociationRJResult::Transient,
                source: AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::NoReasonGiven,
                ),
            };
            self.send(&Pdu::AssociationRJ(rejection)).await?;
            let _ = self.events.send(ScpEvent::AssociationRejected {
                calling_ae_title: rq.calling_ae_title,
                rejection,
            });
            self.close().await;
            return Ok(false);
        }
        self.contexts = accepted;

        let requestor_max_pdu_length = rq
            .user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);
        // zero means unlimited
        let requestor_max_pdu_length = if requestor_max_pdu_length == 0 {
            u32::MAX
        } else {
            requestor_max_pdu_length
        };
        self.send_max_pdu_length = self
            .options
            .max_pdu_length
            .min(requestor_max_pdu_length)
            .max(MINIMUM_PDU_SIZE);

        let ac = Pdu::AssociationAC(AssociationAC {
            protocol_version: rq.protocol_version,
            called_ae_title: rq.called_ae_title,
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context_name: rq.application_context_name,
            presentation_contexts: results,
            user_variables: vec![
                UserVariableItem::MaxLength(self.options.max_pdu_length),
                UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });
        self.send(&ac).await?;

        info!(
            calling_ae_title = %rq.calling_ae_title,
            peer = %self.peer_address,
            "association established"
        );
        let _ = self.events.send(ScpEvent::AssociationEstablished {
            calling_ae_title: rq.calling_ae_title,
            peer_address: self.peer_address,
        });
        Ok(true)
    }

    async fn rejection_reason(
        &self,
        rq: &AssociationRQ,
    ) -> Option<AssociationRJServiceUserReason> {
        if !self.options.admits_calling_ae(&rq.calling_ae_title) {
            return Some(AssociationRJServiceUserReason::CallingAeTitleNotRecognized);
        }
        if self.options.ae_title != rq.called_ae_title.as_str() {
            return Some(AssociationRJServiceUserReason::CalledAeTitleNotRecognized);
        }
        let info = AssociationInfo {
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            peer_address: self.peer_address,
        };
        if !self.delegate.should_accept(&info).await {
            return Some(AssociationRJServiceUserReason::NoReasonGiven);
        }
        None
    }

    /// The established-association command loop.
    async fn serve(&mut self) -> Result<()> {
        let mut assembler = MessageAssembler::new(self.contexts.iter().map(|(id, _)| *id));
        loop {
            match self.receive().await {
                Ok(Pdu::PData { data }) => {
                    for pdv in data {
                        match assembler.push(pdv) {
                            Ok(Some(message)) => {
                                match self.handle_message(&mut assembler, message).await? {
                                    LoopControl::Continue => {}
                                    LoopControl::Closed => return Ok(()),
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                self.abort_unexpected().await;
                                return Err(e).context(AssembleSnafu);
                            }
                        }
                    }
                }
                Ok(Pdu::ReleaseRQ) => {
                    self.send(&Pdu::ReleaseRP).await?;
                    let _ = self.events.send(ScpEvent::AssociationReleased {
                        calling_ae_title: self.calling_ae_title.clone(),
                    });
                    self.close().await;
                    return Ok(());
                }
                Ok(Pdu::AbortRQ { source }) => {
                    debug!(peer = %self.peer_address, "association aborted by peer: {:?}", source);
                    self.close().await;
                    return Ok(());
                }
                Ok(pdu) => {
                    self.abort_unexpected().await;
                    return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
                Err(dicomnet_ul::association::Error::ConnectionClosed { .. }) => {
                    debug!(peer = %self.peer_address, "connection closed by peer");
                    return Ok(());
                }
                Err(e) => {
                    self.abort_unexpected().await;
                    return Err(e).context(AssociationSnafu);
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        assembler: &mut MessageAssembler,
        message: AssembledMessage,
    ) -> Result<LoopControl> {
        let command = match CommandSet::from_bytes(&message.command) {
            Ok(command) => command,
            Err(e) => {
                self.abort_unexpected().await;
                return Err(e).context(CommandSnafu);
            }
        };
        let code = command.command_field_code().context(CommandSnafu)?;

        match CommandField::from_code(code) {
            Some(CommandField::NActionRq) => self.handle_action(assembler, &command, message).await,
            // responses are never answered
            _ if code & 0x8000 != 0 => {
                warn!(code, "dropping unsolicited DIMSE response");
                Ok(LoopControl::Continue)
            }
            _ => {
                warn!(code, "unsupported DIMSE operation");
                let message_id = command.message_id().unwrap_or(0);
                let rsp = commands::error_response(
                    code,
                    message_id,
                    status::UNRECOGNIZED_OPERATION,
                )
                .context(CommandSnafu)?;
                self.send_command(message.presentation_context_id, &rsp)
                    .await?;
                Ok(LoopControl::Continue)
            }
        }
    }

    /// Serve one N-ACTION commitment request:
    /// answer the action, run the delegate,
    /// then report the outcome with an N-EVENT-REPORT
    /// and wait for its response on this same association.
    async fn handle_action(
        &mut self,
        assembler: &mut MessageAssembler,
        command: &CommandSet,
        message: AssembledMessage,
    ) -> Result<LoopControl> {
        let context_id = message.presentation_context_id;
        let message_id = command.message_id().context(CommandSnafu)?;
        let sop_class_uid = command.requested_sop_class_uid().context(CommandSnafu)?;
        let action_type_id = command.action_type_id().context(CommandSnafu)?;

        if sop_class_uid != uids::STORAGE_COMMITMENT_PUSH_MODEL {
            warn!(sop_class_uid = %sop_class_uid, "N-ACTION on unsupported SOP class");
            let rsp = commands::error_response(
                CommandField::NActionRq as u16,
                message_id,
                status::SOP_CLASS_NOT_SUPPORTED,
            )
            .context(CommandSnafu)?;
            self.send_command(context_id, &rsp).await?;
            return Ok(LoopControl::Continue);
        }
        if action_type_id != 1 {
            warn!(action_type_id, "unsupported N-ACTION type");
            let rsp = commands::error_response(
                CommandField::NActionRq as u16,
                message_id,
                status::UNRECOGNIZED_OPERATION,
            )
            .context(CommandSnafu)?;
            self.send_command(context_id, &rsp).await?;
            return Ok(LoopControl::Continue);
        }

        let transfer_syntax = self.transfer_syntax_for(context_id)?.to_string();

        // a commitment request without (or with a bad) information
        // data set is answered and otherwise ignored
        let request = message
            .dataset
            .as_deref()
            .ok_or(None)
            .and_then(|data| {
                dataset::read_action_info(data, &transfer_syntax).map_err(Some)
            });
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                let detail = match e {
                    Some(e) => snafu::Report::from_error(&e).to_string(),
                    None => "commitment request without a data set".to_string(),
                };
                warn!("bad commitment request: {}", detail);
                let _ = self.events.send(ScpEvent::Error { detail });
                let rsp = commands::error_response(
                    CommandField::NActionRq as u16,
                    message_id,
                    status::PROCESSING_FAILURE,
                )
                .context(CommandSnafu)?;
                self.send_command(context_id, &rsp).await?;
                return Ok(LoopControl::Continue);
            }
        };

        let _ = self.events.send(ScpEvent::CommitmentRequestReceived {
            transaction_uid: request.transaction_uid.clone(),
            reference_count: request.references.len(),
        });

        let rsp = NActionRsp {
            message_id_being_responded_to: message_id,
            affected_sop_class_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL,
            affected_sop_instance_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            action_type_id: 1,
            status: status::SUCCESS,
        }
        .encode(false)
        .context(CommandSnafu)?;
        self.send_command(context_id, &rsp).await?;

        // the delegate runs on its own task;
        // a panic there becomes an error event, not a dead server
        let delegate = self.delegate.clone();
        let request_for_delegate = request.clone();
        let outcome = tokio::spawn(async move {
            delegate
                .process_commitment_request(&request_for_delegate)
                .await
        })
        .await;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let detail = format!("commitment delegate failed: {}", e);
                let _ = self.events.send(ScpEvent::Error {
                    detail: detail.clone(),
                });
                self.abort_unexpected().await;
                return DelegateFailedSnafu { detail }.fail();
            }
        };

        let event_type_id = if result.is_success() { 1 } else { 2 };
        let event_info = dataset::event_report_dataset(
            &request.transaction_uid,
            &result.committed,
            &result.failed,
        );
        let event_info_bytes =
            dataset::write_dataset(&event_info, &transfer_syntax).context(DatasetSnafu)?;

        let event_message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        let event_command = NEventReportRq {
            message_id: event_message_id,
            affected_sop_class_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL,
            affected_sop_instance_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            event_type_id,
        }
        .encode(true)
        .context(CommandSnafu)?;

        let pdus = fragment_message(
            context_id,
            &event_command,
            Some(&event_info_bytes),
            self.send_max_pdu_length,
        )
        .context(AssembleSnafu)?;
        for pdu in &pdus {
            self.send(pdu).await?;
        }

        let control = self
            .await_event_report_response(assembler, event_message_id)
            .await?;

        let _ = self.events.send(ScpEvent::CommitmentResultSent {
            transaction_uid: request.transaction_uid,
            success: result.is_success(),
        });

        Ok(control)
    }

    /// Wait for the N-EVENT-REPORT response,
    /// serialising commitment flows on this association.
    async fn await_event_report_response(
        &mut self,
        assembler: &mut MessageAssembler,
        event_message_id: u16,
    ) -> Result<LoopControl> {
        loop {
            match self.receive().await {
                Ok(Pdu::PData { data }) => {
                    for pdv in data {
                        let message = match assembler.push(pdv) {
                            Ok(Some(message)) => message,
                            Ok(None) => continue,
                            Err(e) => {
                                self.abort_unexpected().await;
                                return Err(e).context(AssembleSnafu);
                            }
                        };
                        let command =
                            CommandSet::from_bytes(&message.command).context(CommandSnafu)?;
                        match command.command_field().context(CommandSnafu)? {
                            CommandField::NEventReportRsp => {
                                let responded_to = command
                                    .message_id_being_responded_to()
                                    .context(CommandSnafu)?;
                                if responded_to != event_message_id {
                                    warn!(
                                        responded_to,
                                        event_message_id,
                                        "event report response for an unknown message"
                                    );
                                }
                                let status = command.status().context(CommandSnafu)?;
                                if status != status::SUCCESS {
                                    warn!(status, "event report was not accepted");
                                }
                                return Ok(LoopControl::Continue);
                            }
                            other => {
                                self.abort_unexpected().await;
                                return UnexpectedCommandSnafu { code: other as u16 }.fail();
                            }
                        }
                    }
                }
                Ok(Pdu::ReleaseRQ) => {
                    // the requestor is done with the association
                    // before acknowledging the event report
                    self.send(&Pdu::ReleaseRP).await?;
                    let _ = self.events.send(ScpEvent::AssociationReleased {
                        calling_ae_title: self.calling_ae_title.clone(),
                    });
                    self.close().await;
                    return Ok(LoopControl::Closed);
                }
                Ok(Pdu::AbortRQ { source }) => {
                    debug!("association aborted while awaiting event report response: {:?}", source);
                    self.close().await;
                    return Ok(LoopControl::Closed);
                }
                Ok(pdu) => {
                    self.abort_unexpected().await;
                    return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
                Err(e) => {
                    self.abort_unexpected().await;
                    return Err(e).context(AssociationSnafu);
                }
            }
        }
    }

    /// Fragment and send a command set with no data set.
    async fn send_command(&mut self, context_id: u8, command: &[u8]) -> Result<()> {
        let pdus = fragment_message(context_id, command, None, self.send_max_pdu_length)
            .context(AssembleSnafu)?;
        for pdu in &pdus {
            self.send(pdu).await?;
        }
        Ok(())
    }

    fn transfer_syntax_for(&self, context_id: u8) -> Result<&str> {
        self.contexts
            .iter()
            .find(|(id, _)| *id == context_id)
            .map(|(_, ts)| ts.as_str())
            .context(NoTransferSyntaxSnafu { id: context_id })
    }

    async fn abort_unexpected(&mut self) {
        let abort = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
        };
        let _ =
            write_pdu_to_wire(&mut self.socket, &mut self.write_buffer, &abort).await;
        self.close().await;
    }

    async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.socket.shutdown().await;
    }
}

/// Negotiate the proposed presentation contexts:
/// only the Storage Commitment Push Model SOP class is admitted,
/// paired with the first proposed transfer syntax
/// that this provider supports.
fn negotiate_presentation_contexts(
    rq: &AssociationRQ,
) -> (Vec<PresentationContextResult>, Vec<(u8, String)>) {
    let mut accepted = Vec::new();
    let results = rq
        .presentation_contexts
        .iter()
        .map(|pc| {
            if pc.abstract_syntax != uids::STORAGE_COMMITMENT_PUSH_MODEL {
                return PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                };
            }
            match pc
                .transfer_syntaxes
                .iter()
                .find(|ts| SUPPORTED_TRANSFER_SYNTAXES.contains(&ts.as_str()))
            {
                Some(ts) => {
                    accepted.push((pc.id, ts.clone()));
                    PresentationContextResult {
                        id: pc.id,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: ts.clone(),
                    }
                }
                None => PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                },
            }
        })
        .collect();
    (results, accepted)
}
