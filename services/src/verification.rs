//! Verification service class user (C-ECHO).
//!
//! The simplest of DICOM services:
//! establish an association proposing the Verification SOP class,
//! send a C-ECHO request, read back its status, release.
//! Useful as a connectivity probe against any DICOM node.

use snafu::{ensure, ResultExt, Snafu};
use tracing::debug;

use dicom_dictionary_std::uids;
use dicomnet_ul::breaker::{CircuitBreakerRegistry, ExecuteError};
use dicomnet_ul::pdata::MessageAssembler;
use dicomnet_ul::{ClientAssociationOptions, Received};

use crate::commands::{status, CEchoRq, Command, CommandField, CommandSet};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// association failure
    Association {
        source: dicomnet_ul::association::Error,
    },

    /// DIMSE command codec failure
    Command { source: crate::commands::Error },

    /// fragment reassembly failure
    Assemble {
        source: dicomnet_ul::pdata::Error,
    },

    /// the peer released the association before answering
    NoResponse,

    #[snafu(display("expected a C-ECHO response, got command {:?}", command_field))]
    UnexpectedCommand { command_field: CommandField },

    #[snafu(display("response refers to message {}, expected {}", got, expected))]
    MessageIdMismatch { expected: u16, got: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of a verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationResult {
    /// the message identifier of the request
    pub message_id: u16,
    /// the DIMSE status of the response
    pub status: u16,
    /// whether the status signals success
    pub success: bool,
}

/// A verification (C-ECHO) service class user.
///
/// # Example
///
/// ```no_run
/// # use dicomnet_services::verification::VerificationScu;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let result = VerificationScu::new("ECHO-SCU", "MAIN-PACS")
///     .echo("10.0.0.5:104")
///     .await?;
/// assert!(result.success);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VerificationScu {
    options: ClientAssociationOptions,
    message_id: u16,
}

impl VerificationScu {
    /// Create a verification SCU with the given AE titles.
    pub fn new(
        calling_ae_title: impl Into<String>,
        called_ae_title: impl Into<String>,
    ) -> Self {
        VerificationScu::with_options(
            ClientAssociationOptions::new()
                .calling_ae_title(calling_ae_title.into())
                .called_ae_title(called_ae_title.into()),
        )
    }

    /// Create a verification SCU over pre-built association options.
    /// The Verification SOP class is proposed in addition to
    /// whatever the options already carry.
    pub fn with_options(options: ClientAssociationOptions) -> Self {
        VerificationScu {
            options: options.with_abstract_syntax(uids::VERIFICATION),
            message_id: 1,
        }
    }

    /// Override the C-ECHO message identifier. The default is 1.
    pub fn message_id(mut self, message_id: u16) -> Self {
        self.message_id = message_id;
        self
    }

    /// Run one C-ECHO against the node at the given address.
    pub async fn echo<A>(self, address: A) -> Result<VerificationResult>
    where
        A: tokio::net::ToSocketAddrs,
    {
        let VerificationScu {
            options,
            message_id,
        } = self;

        let mut association = options.establish(address).await.context(AssociationSnafu)?;
        let presentation_context_id = association
            .accepted_presentation_contexts()
            .next()
            .map(|pc| pc.id)
            // establishment fails earlier when nothing was accepted
            .unwrap_or(1);

        let command = CEchoRq {
            message_id,
            affected_sop_class_uid: uids::VERIFICATION,
        }
        .encode(false)
        .context(CommandSnafu)?;
        association
            .send_message(presentation_context_id, &command, None)
            .await
            .context(AssociationSnafu)?;

        let mut assembler = MessageAssembler::new([presentation_context_id]);
        let message = 'outer: loop {
            match association.receive().await.context(AssociationSnafu)? {
                Received::Pdata(pdvs) => {
                    for pdv in pdvs {
                        if let Some(message) = assembler.push(pdv).context(AssembleSnafu)? {
                            break 'outer message;
                        }
                    }
                }
                Received::Released => return NoResponseSnafu.fail(),
            }
        };

        let response = CommandSet::from_bytes(&message.command).context(CommandSnafu)?;
        let command_field = response.command_field().context(CommandSnafu)?;
        ensure!(
            command_field == CommandField::CEchoRsp,
            UnexpectedCommandSnafu { command_field }
        );
        let responded_to = response
            .message_id_being_responded_to()
            .context(CommandSnafu)?;
        ensure!(
            responded_to == message_id,
            MessageIdMismatchSnafu {
                expected: message_id,
                got: responded_to
            }
        );
        let status = response.status().context(CommandSnafu)?;
        debug!(status, "verification response received");

        association.release().await.context(AssociationSnafu)?;

        Ok(VerificationResult {
            message_id,
            status,
            success: status == status::SUCCESS,
        })
    }

    /// Run one C-ECHO under the endpoint's circuit breaker:
    /// the outcome is recorded against `host:port`,
    /// and the call fails fast while the circuit is open.
    pub async fn echo_guarded(
        self,
        host: &str,
        port: u16,
        breakers: &CircuitBreakerRegistry,
    ) -> Result<VerificationResult, ExecuteError<Error>> {
        let breaker = breakers.breaker_for(host, port);
        breaker.execute(|| self.echo((host, port))).await
    }
}
