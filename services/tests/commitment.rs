//! End-to-end tests for the storage commitment provider,
//! with the requestor side driven through the upper layer crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use matches::assert_matches;
use tokio::net::TcpStream;

use dicom_dictionary_std::uids;
use dicomnet_services::commands::{
    status, Command, CommandField, CommandSet, NActionRq, NEventReportRsp,
};
use dicomnet_services::commitment::dataset;
use dicomnet_services::{
    CommitmentRequest, CommitmentResult, FailedSopReference, FailureReason, ScpEvent,
    SopReference, StorageCommitmentDelegate, StorageCommitmentHandle, StorageCommitmentOptions,
    StorageCommitmentServer,
};
use dicomnet_ul::association::Error as AssociationError;
use dicomnet_ul::pdata::{AssembledMessage, MessageAssembler};
use dicomnet_ul::pdu::{
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
};
use dicomnet_ul::{ClientAssociation, ClientAssociationOptions, Received};

/// A delegate that commits to everything it is asked about.
struct CommitAll;

#[async_trait]
impl StorageCommitmentDelegate for CommitAll {
    async fn process_commitment_request(&self, request: &CommitmentRequest) -> CommitmentResult {
        CommitmentResult {
            committed: request.references.clone(),
            failed: vec![],
        }
    }
}

/// A delegate that only knows the first referenced instance.
struct FailAfterFirst;

#[async_trait]
impl StorageCommitmentDelegate for FailAfterFirst {
    async fn process_commitment_request(&self, request: &CommitmentRequest) -> CommitmentResult {
        let mut references = request.references.iter();
        CommitmentResult {
            committed: references.next().cloned().into_iter().collect(),
            failed: references
                .map(|reference| FailedSopReference {
                    reference: reference.clone(),
                    failure_reason: FailureReason::NoSuchObjectInstance,
                })
                .collect(),
        }
    }
}

/// A delegate that vetoes every association.
struct VetoAll;

#[async_trait]
impl StorageCommitmentDelegate for VetoAll {
    async fn should_accept(
        &self,
        _info: &dicomnet_services::AssociationInfo,
    ) -> bool {
        false
    }

    async fn process_commitment_request(&self, _request: &CommitmentRequest) -> CommitmentResult {
        CommitmentResult::default()
    }
}

async fn start_server(
    options: StorageCommitmentOptions,
    delegate: Arc<dyn StorageCommitmentDelegate>,
) -> StorageCommitmentHandle {
    let mut handle = StorageCommitmentServer::new(options.port(0), delegate)
        .start()
        .await
        .expect("server must start");
    assert_matches!(next_event(&mut handle).await, ScpEvent::Started { .. });
    handle
}

async fn next_event(handle: &mut StorageCommitmentHandle) -> ScpEvent {
    tokio::time::timeout(Duration::from_secs(5), handle.next_event())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended unexpectedly")
}

fn scu_options(calling_ae_title: &str) -> ClientAssociationOptions {
    ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title.to_string())
        .called_ae_title("COMMIT-SCP")
        .with_presentation_context(
            uids::STORAGE_COMMITMENT_PUSH_MODEL,
            [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN],
        )
}

async fn receive_message(
    association: &mut ClientAssociation<TcpStream>,
    assembler: &mut MessageAssembler,
) -> AssembledMessage {
    loop {
        match association.receive().await.expect("receive must succeed") {
            Received::Pdata(pdvs) => {
                for pdv in pdvs {
                    if let Some(message) = assembler.push(pdv).expect("assembly must succeed") {
                        return message;
                    }
                }
            }
            Received::Released => panic!("association released before a response arrived"),
        }
    }
}

fn sample_references() -> Vec<SopReference> {
    vec![
        SopReference::new("1.2.840.10008.5.1.4.1.1.2", "1.2.3.4.1"),
        SopReference::new("1.2.840.10008.5.1.4.1.1.2", "1.2.3.4.2"),
    ]
}

/// Drive one full commitment transaction from the SCU side,
/// returning the received event report command and data set.
async fn run_commitment_transaction(
    association: &mut ClientAssociation<TcpStream>,
    transaction_uid: &str,
    references: Vec<SopReference>,
) -> (CommandSet, Vec<u8>, String) {
    let pc = association
        .accepted_presentation_contexts()
        .next()
        .expect("context must be accepted")
        .clone();

    let request = CommitmentRequest {
        transaction_uid: transaction_uid.to_string(),
        references,
    };
    let action_info =
        dataset::write_dataset(&dataset::action_info_dataset(&request), &pc.transfer_syntax)
            .expect("data set must encode");
    let command = NActionRq {
        message_id: 1,
        requested_sop_class_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL,
        requested_sop_instance_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
        action_type_id: 1,
    }
    .encode(true)
    .expect("command must encode");

    association
        .send_message(pc.id, &command, Some(&action_info))
        .await
        .expect("send must succeed");

    let mut assembler = MessageAssembler::new([pc.id]);

    // first the N-ACTION response
    let rsp = receive_message(association, &mut assembler).await;
    let rsp_command = CommandSet::from_bytes(&rsp.command).unwrap();
    assert_eq!(
        rsp_command.command_field().unwrap(),
        CommandField::NActionRsp
    );
    assert_eq!(rsp_command.message_id_being_responded_to().unwrap(), 1);
    assert_eq!(rsp_command.status().unwrap(), status::SUCCESS);

    // then the event report request with the outcome
    let event_report = receive_message(association, &mut assembler).await;
    let event_command = CommandSet::from_bytes(&event_report.command).unwrap();
    assert_eq!(
        event_command.command_field().unwrap(),
        CommandField::NEventReportRq
    );
    let event_info = event_report
        .dataset
        .expect("event report must carry a data set");

    // acknowledge the event report
    let ack = NEventReportRsp {
        message_id_being_responded_to: event_command.message_id().unwrap(),
        affected_sop_class_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL,
        affected_sop_instance_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
        event_type_id: event_command.event_type_id().unwrap(),
        status: status::SUCCESS,
    }
    .encode(false)
    .expect("ack must encode");
    association
        .send_message(pc.id, &ack, None)
        .await
        .expect("ack must be sent");

    (event_command, event_info, pc.transfer_syntax)
}

#[tokio::test]
async fn commitment_round_trip_success() {
    let mut handle =
        start_server(StorageCommitmentOptions::new(), Arc::new(CommitAll)).await;
    let addr = handle.local_addr();

    let mut association = scu_options("COMMIT-SCU").establish(addr).await.unwrap();
    // the first supported transfer syntax of the proposal is taken
    let negotiated_ts = association
        .accepted_presentation_contexts()
        .next()
        .unwrap()
        .transfer_syntax
        .clone();
    assert_eq!(negotiated_ts, uids::EXPLICIT_VR_LITTLE_ENDIAN);

    let references = sample_references();
    let (event_command, event_info, transfer_syntax) =
        run_commitment_transaction(&mut association, "1.2.3", references.clone()).await;

    assert_eq!(event_command.event_type_id().unwrap(), 1);
    let (transaction_uid, committed, failed) =
        dataset::read_event_info(&event_info, &transfer_syntax).unwrap();
    assert_eq!(transaction_uid, "1.2.3");
    assert_eq!(committed, references);
    assert!(failed.is_empty());

    association.release().await.unwrap();

    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::AssociationEstablished { calling_ae_title, .. } if calling_ae_title == "COMMIT-SCU"
    );
    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::CommitmentRequestReceived { transaction_uid, reference_count: 2 }
            if transaction_uid == "1.2.3"
    );
    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::CommitmentResultSent { transaction_uid, success: true }
            if transaction_uid == "1.2.3"
    );
    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::AssociationReleased { calling_ae_title } if calling_ae_title == "COMMIT-SCU"
    );

    handle.shutdown().await;
    assert_matches!(next_event(&mut handle).await, ScpEvent::Stopped);
}

#[tokio::test]
async fn commitment_reports_failed_instances() {
    let mut handle =
        start_server(StorageCommitmentOptions::new(), Arc::new(FailAfterFirst)).await;
    let addr = handle.local_addr();

    let mut association = scu_options("COMMIT-SCU").establish(addr).await.unwrap();
    let references = sample_references();
    let (event_command, event_info, transfer_syntax) =
        run_commitment_transaction(&mut association, "1.2.9", references.clone()).await;

    // failures are reported with event type 2
    assert_eq!(event_command.event_type_id().unwrap(), 2);
    let (transaction_uid, committed, failed) =
        dataset::read_event_info(&event_info, &transfer_syntax).unwrap();
    assert_eq!(transaction_uid, "1.2.9");
    assert_eq!(committed, references[..1]);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reference, references[1]);
    assert_eq!(failed[0].failure_reason, FailureReason::NoSuchObjectInstance);

    association.release().await.unwrap();

    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::AssociationEstablished { .. }
    );
    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::CommitmentRequestReceived { .. }
    );
    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::CommitmentResultSent { success: false, .. }
    );
}

#[tokio::test]
async fn calling_ae_outside_the_whitelist_is_rejected() {
    let options = StorageCommitmentOptions::new().allow_calling_ae("KNOWN");
    let mut handle = start_server(options, Arc::new(CommitAll)).await;
    let addr = handle.local_addr();

    let err = scu_options("OTHER").establish(addr).await.unwrap_err();
    assert_matches!(
        err,
        AssociationError::Rejected {
            association_rj: dicomnet_ul::pdu::AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CallingAeTitleNotRecognized
                ),
            },
            ..
        }
    );

    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::AssociationRejected { calling_ae_title, .. } if calling_ae_title == "OTHER"
    );
}

#[tokio::test]
async fn blacklisted_calling_ae_is_rejected_despite_whitelist() {
    let options = StorageCommitmentOptions::new()
        .allow_calling_ae("SHADY")
        .deny_calling_ae("SHADY");
    let mut handle = start_server(options, Arc::new(CommitAll)).await;
    let addr = handle.local_addr();

    let err = scu_options("SHADY").establish(addr).await.unwrap_err();
    assert_matches!(
        err,
        AssociationError::Rejected {
            association_rj: dicomnet_ul::pdu::AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CallingAeTitleNotRecognized
                ),
                ..
            },
            ..
        }
    );
}

#[tokio::test]
async fn wrong_called_ae_title_is_rejected() {
    let mut handle =
        start_server(StorageCommitmentOptions::new(), Arc::new(CommitAll)).await;
    let addr = handle.local_addr();

    let err = scu_options("COMMIT-SCU")
        .called_ae_title("WRONG-SCP")
        .establish(addr)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        AssociationError::Rejected {
            association_rj: dicomnet_ul::pdu::AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAeTitleNotRecognized
                ),
                ..
            },
            ..
        }
    );
}

#[tokio::test]
async fn delegate_can_veto_the_association() {
    let mut handle =
        start_server(StorageCommitmentOptions::new(), Arc::new(VetoAll)).await;
    let addr = handle.local_addr();

    let err = scu_options("COMMIT-SCU").establish(addr).await.unwrap_err();
    assert_matches!(
        err,
        AssociationError::Rejected {
            association_rj: dicomnet_ul::pdu::AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven
                ),
                ..
            },
            ..
        }
    );
}

#[tokio::test]
async fn association_without_the_commitment_sop_class_is_rejected() {
    let mut handle =
        start_server(StorageCommitmentOptions::new(), Arc::new(CommitAll)).await;
    let addr = handle.local_addr();

    let err = ClientAssociationOptions::new()
        .calling_ae_title("COMMIT-SCU")
        .called_ae_title("COMMIT-SCP")
        .with_abstract_syntax(uids::VERIFICATION)
        .establish(addr)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        AssociationError::Rejected {
            association_rj: dicomnet_ul::pdu::AssociationRJ {
                result: AssociationRJResult::Transient,
                source: AssociationRJSource::ServiceProviderAcse(_),
            },
            ..
        }
    );
}

#[tokio::test]
async fn action_on_an_unsupported_sop_class_is_refused() {
    let mut handle =
        start_server(StorageCommitmentOptions::new(), Arc::new(CommitAll)).await;
    let addr = handle.local_addr();

    let mut association = scu_options("COMMIT-SCU").establish(addr).await.unwrap();
    let pc_id = association
        .accepted_presentation_contexts()
        .next()
        .unwrap()
        .id;

    let command = NActionRq {
        message_id: 4,
        requested_sop_class_uid: uids::VERIFICATION,
        requested_sop_instance_uid: uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
        action_type_id: 1,
    }
    .encode(false)
    .unwrap();
    association.send_message(pc_id, &command, None).await.unwrap();

    let mut assembler = MessageAssembler::new([pc_id]);
    let rsp = receive_message(&mut association, &mut assembler).await;
    let rsp_command = CommandSet::from_bytes(&rsp.command).unwrap();
    assert_eq!(rsp_command.message_id_being_responded_to().unwrap(), 4);
    assert_eq!(
        rsp_command.status().unwrap(),
        status::SOP_CLASS_NOT_SUPPORTED
    );

    association.release().await.unwrap();
}

#[tokio::test]
async fn connections_beyond_the_limit_are_dropped() {
    let options = StorageCommitmentOptions::new().max_concurrent_associations(1);
    let mut handle = start_server(options, Arc::new(CommitAll)).await;
    let addr = handle.local_addr();

    let mut first = scu_options("COMMIT-SCU").establish(addr).await.unwrap();
    assert_matches!(
        next_event(&mut handle).await,
        ScpEvent::AssociationEstablished { .. }
    );

    // the second connection is dropped before any negotiation
    let outcome = scu_options("COMMIT-SCU")
        .artim_timeout(Duration::from_secs(2))
        .establish(addr)
        .await;
    assert!(outcome.is_err(), "second association must not be accepted");

    first.release().await.unwrap();
}
