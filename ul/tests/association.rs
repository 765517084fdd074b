//! Loopback tests for the client association orchestrator,
//! with the acceptor side driven directly through the PDU codec.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use matches::assert_matches;
use tokio::net::{TcpListener, TcpStream};

use dicomnet_ul::association::{Error, Received};
use dicomnet_ul::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, PDataValue, PDataValueType, Pdu,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use dicomnet_ul::transport::{read_pdu_from_wire, write_pdu_to_wire};
use dicomnet_ul::ClientAssociationOptions;

const VERIFICATION: &str = "1.2.840.10008.1.1";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

struct Acceptor {
    socket: TcpStream,
    read_buffer: BytesMut,
    write_buffer: Vec<u8>,
}

impl Acceptor {
    async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.expect("accept must succeed");
        Acceptor {
            socket,
            read_buffer: BytesMut::new(),
            write_buffer: Vec::new(),
        }
    }

    async fn receive(&mut self) -> dicomnet_ul::association::Result<Pdu> {
        read_pdu_from_wire(&mut self.socket, &mut self.read_buffer, DEFAULT_MAX_PDU).await
    }

    async fn send(&mut self, pdu: &Pdu) {
        write_pdu_to_wire(&mut self.socket, &mut self.write_buffer, pdu)
            .await
            .expect("send must succeed");
    }

    /// Read the association request and accept every proposed context
    /// with its first transfer syntax.
    async fn negotiate(&mut self) -> AssociationRQ {
        let rq = match self.receive().await.expect("expecting A-ASSOCIATE-RQ") {
            Pdu::AssociationRQ(rq) => rq,
            other => panic!("expected A-ASSOCIATE-RQ, got {:?}", other),
        };
        let presentation_contexts = rq
            .presentation_contexts
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: pc.transfer_syntaxes[0].clone(),
            })
            .collect();
        let ac = Pdu::AssociationAC(AssociationAC {
            protocol_version: rq.protocol_version,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts,
            user_variables: vec![UserVariableItem::MaxLength(DEFAULT_MAX_PDU)],
        });
        self.send(&ac).await;
        rq
    }
}

fn scu_options() -> ClientAssociationOptions {
    ClientAssociationOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("MOCK-SCP")
        .with_abstract_syntax(VERIFICATION)
}

#[tokio::test]
async fn establish_and_release() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        let rq = acceptor.negotiate().await;
        assert_eq!(rq.calling_ae_title, "ECHO-SCU");
        assert_eq!(rq.called_ae_title, "MOCK-SCP");

        assert_matches!(acceptor.receive().await.unwrap(), Pdu::ReleaseRQ);
        acceptor.send(&Pdu::ReleaseRP).await;
    });

    let mut association = scu_options().establish(addr).await.unwrap();
    assert_eq!(association.accepted_presentation_contexts().count(), 1);
    association.release().await.unwrap();

    scp.await.unwrap();
}

#[tokio::test]
async fn data_transfer_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        acceptor.negotiate().await;

        // echo every P-DATA-TF until the release request comes in
        loop {
            match acceptor.receive().await.unwrap() {
                pdu @ Pdu::PData { .. } => acceptor.send(&pdu).await,
                Pdu::ReleaseRQ => {
                    acceptor.send(&Pdu::ReleaseRP).await;
                    break;
                }
                other => panic!("unexpected PDU {:?}", other),
            }
        }
    });

    let mut association = scu_options().establish(addr).await.unwrap();
    let pc_id = association
        .accepted_presentation_contexts()
        .next()
        .unwrap()
        .id;

    let payload = vec![0x42u8; 512];
    association
        .send_pdata(vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: payload.clone(),
        }])
        .await
        .unwrap();

    match association.receive().await.unwrap() {
        Received::Pdata(pdvs) => {
            assert_eq!(pdvs.len(), 1);
            assert_eq!(pdvs[0].data, payload);
        }
        other => panic!("expected P-DATA, got {:?}", other),
    }

    association.release().await.unwrap();
    scp.await.unwrap();
}

#[tokio::test]
async fn sending_on_unaccepted_context_is_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        acceptor.negotiate().await;
        assert_matches!(acceptor.receive().await.unwrap(), Pdu::ReleaseRQ);
        acceptor.send(&Pdu::ReleaseRP).await;
    });

    let mut association = scu_options().establish(addr).await.unwrap();
    let err = association
        .send_pdata(vec![PDataValue {
            presentation_context_id: 99,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0x00],
        }])
        .await
        .unwrap_err();
    assert_matches!(
        err,
        Error::UnacceptedPresentationContext {
            presentation_context_id: 99,
            ..
        }
    );

    association.release().await.unwrap();
    scp.await.unwrap();
}

#[tokio::test]
async fn negotiated_max_pdu_is_the_minimum_of_both_proposals() {
    for (advertised, expected) in [(8192u32, 8192u32), (1024, 4096), (0, DEFAULT_MAX_PDU)] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let scp = tokio::spawn(async move {
            let mut acceptor = Acceptor::accept(&listener).await;
            let rq = match acceptor.receive().await.unwrap() {
                Pdu::AssociationRQ(rq) => rq,
                other => panic!("expected A-ASSOCIATE-RQ, got {:?}", other),
            };
            let presentation_contexts = rq
                .presentation_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: pc.transfer_syntaxes[0].clone(),
                })
                .collect();
            acceptor
                .send(&Pdu::AssociationAC(AssociationAC {
                    protocol_version: rq.protocol_version,
                    called_ae_title: rq.called_ae_title,
                    calling_ae_title: rq.calling_ae_title,
                    application_context_name: rq.application_context_name,
                    presentation_contexts,
                    user_variables: vec![UserVariableItem::MaxLength(advertised)],
                }))
                .await;
            assert_matches!(acceptor.receive().await.unwrap(), Pdu::ReleaseRQ);
            acceptor.send(&Pdu::ReleaseRP).await;
        });

        let mut association = scu_options().establish(addr).await.unwrap();
        // the accorded length is the minimum of both proposals,
        // clamped to the standard minimum, with zero meaning unlimited
        assert_eq!(association.negotiated_max_pdu_length(), expected);
        association.release().await.unwrap();
        scp.await.unwrap();
    }
}

#[tokio::test]
async fn rejection_is_surfaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        let _rq = acceptor.receive().await.unwrap();
        acceptor
            .send(&Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CallingAeTitleNotRecognized,
                ),
            }))
            .await;
    });

    let err = scu_options().establish(addr).await.unwrap_err();
    assert_matches!(
        err,
        Error::Rejected {
            association_rj: AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CallingAeTitleNotRecognized
                ),
            },
            ..
        }
    );
    scp.await.unwrap();
}

#[tokio::test]
async fn artim_expiry_aborts_the_association() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        // read the request but never answer it
        let _rq = acceptor.receive().await.unwrap();
        // the requestor gives up with an abort
        assert_matches!(acceptor.receive().await.unwrap(), Pdu::AbortRQ { .. });
    });

    let started = Instant::now();
    let err = scu_options()
        .artim_timeout(Duration::from_millis(300))
        .establish(addr)
        .await
        .unwrap_err();
    assert_matches!(err, Error::ArtimExpired { .. });
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300) && elapsed < Duration::from_secs(5),
        "unexpected ARTIM latency: {:?}",
        elapsed
    );

    scp.await.unwrap();
}

#[tokio::test]
async fn all_contexts_rejected_means_no_association() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        let rq = match acceptor.receive().await.unwrap() {
            Pdu::AssociationRQ(rq) => rq,
            other => panic!("expected A-ASSOCIATE-RQ, got {:?}", other),
        };
        let presentation_contexts = rq
            .presentation_contexts
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            })
            .collect();
        acceptor
            .send(&Pdu::AssociationAC(AssociationAC {
                protocol_version: rq.protocol_version,
                called_ae_title: rq.called_ae_title,
                calling_ae_title: rq.calling_ae_title,
                application_context_name: rq.application_context_name,
                presentation_contexts,
                user_variables: vec![],
            }))
            .await;
        // the requestor has no use for this association
        assert_matches!(acceptor.receive().await.unwrap(), Pdu::AbortRQ { .. });
    });

    let err = scu_options().establish(addr).await.unwrap_err();
    assert_matches!(err, Error::NoAcceptedPresentationContexts { .. });
    scp.await.unwrap();
}

#[tokio::test]
async fn release_collision_resolves_gracefully() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        acceptor.negotiate().await;
        // request release from the acceptor side right away
        acceptor.send(&Pdu::ReleaseRQ).await;
        // the peer's own release request crossed ours
        assert_matches!(acceptor.receive().await.unwrap(), Pdu::ReleaseRQ);
        assert_matches!(acceptor.receive().await.unwrap(), Pdu::ReleaseRP);
    });

    let mut association = scu_options().establish(addr).await.unwrap();
    // give the acceptor's release request time to be in flight
    tokio::time::sleep(Duration::from_millis(100)).await;
    association.release().await.unwrap();

    scp.await.unwrap();
}

#[tokio::test]
async fn peer_release_is_a_graceful_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = tokio::spawn(async move {
        let mut acceptor = Acceptor::accept(&listener).await;
        acceptor.negotiate().await;
        acceptor.send(&Pdu::ReleaseRQ).await;
        assert_matches!(acceptor.receive().await.unwrap(), Pdu::ReleaseRP);
    });

    let mut association = scu_options().establish(addr).await.unwrap();
    assert_matches!(association.receive().await.unwrap(), Received::Released);

    // the association is over; further operations are state errors
    let err = association
        .send_pdata(vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![],
        }])
        .await
        .unwrap_err();
    assert_matches!(err, Error::InvalidState { .. });

    scp.await.unwrap();
}

#[tokio::test]
async fn empty_presentation_context_list_fails_before_connecting() {
    // the address is never used: validation happens first
    let err = ClientAssociationOptions::new()
        .establish("127.0.0.1:1")
        .await
        .unwrap_err();
    assert_matches!(err, Error::NoPresentationContexts { .. });
}

#[tokio::test]
async fn oversized_calling_ae_title_fails_at_construction() {
    let err = ClientAssociationOptions::new()
        .calling_ae_title("A-VERY-LONG-AE-TITLE")
        .with_abstract_syntax(VERIFICATION)
        .establish("127.0.0.1:1")
        .await
        .unwrap_err();
    assert_matches!(err, Error::InvalidAeTitle { .. });
}
