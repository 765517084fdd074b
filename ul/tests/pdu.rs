use dicomnet_ul::pdu::reader::{read_pdu, Error as ReadError};
use dicomnet_ul::pdu::writer::write_pdu;
use dicomnet_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserIdentity, UserIdentityType, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use matches::assert_matches;
use std::io::Cursor;

fn roundtrip(pdu: &Pdu) -> Pdu {
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, pdu).expect("writing must succeed");
    read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU).expect("reading must succeed")
}

#[test]
fn roundtrip_associate_rq() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "COMMIT-SCU".to_string(),
        called_ae_title: "COMMIT-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.1.20.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUid("1.2.3.4.5".to_string()),
            UserVariableItem::ImplementationVersionName("TEST-010".to_string()),
        ],
    });

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn roundtrip_associate_rq_with_user_identity() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(32768),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                b"operator".to_vec(),
                b"secret".to_vec(),
            )),
        ],
    });

    let read_back = roundtrip(&pdu);
    assert_eq!(read_back, pdu);

    if let Pdu::AssociationRQ(AssociationRQ { user_variables, .. }) = read_back {
        assert_matches!(
            &user_variables[1],
            UserVariableItem::UserIdentityItem(identity)
            if identity.identity_type() == UserIdentityType::UsernamePassword
                && identity.primary_field() == b"operator"
                && identity.secondary_field() == b"secret"
        );
    }
}

#[test]
fn roundtrip_associate_ac() {
    let pdu = Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        called_ae_title: "COMMIT-SCP".to_string(),
        calling_ae_title: "COMMIT-SCU".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUid("1.2.3.4.5".to_string()),
        ],
    });

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn roundtrip_associate_rj() {
    let cases = [
        AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAeTitleNotRecognized,
            ),
        },
        AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
            ),
        },
        AssociationRJ {
            result: AssociationRJResult::Transient,
            source: AssociationRJSource::ServiceProviderAcse(
                dicomnet_ul::pdu::AssociationRJServiceProviderAcseReason::NoReasonGiven,
            ),
        },
    ];

    for case in cases {
        assert_eq!(roundtrip(&Pdu::AssociationRJ(case)), Pdu::AssociationRJ(case));
    }
}

#[test]
fn roundtrip_pdata() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x10, 0x20, 0x30, 0x40],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0xAA; 256],
            },
        ],
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn roundtrip_release_and_abort() {
    assert_eq!(roundtrip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(roundtrip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    for source in [
        AbortRQSource::ServiceUser,
        AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
        AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::ReasonNotSpecified),
    ] {
        assert_eq!(roundtrip(&Pdu::AbortRQ { source }), Pdu::AbortRQ { source });
    }
}

#[test]
fn unrecognized_pdu_type_is_rejected() {
    let bytes = [0x0Au8, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00];
    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU).unwrap_err();
    assert_matches!(err, ReadError::UnrecognizedPduType { pdu_type: 0x0A, .. });
}

#[test]
fn truncated_body_is_rejected() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();
    bytes.truncate(bytes.len() - 10);

    assert!(read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU).is_err());
}

#[test]
fn overlong_uid_is_rejected() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            // 65 characters, above the 64 byte limit for UIDs
            abstract_syntax: "1.".repeat(32) + "9",
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();

    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU).unwrap_err();
    assert_matches!(err, ReadError::InvalidUid { .. });
}

#[test]
fn non_printable_uid_is_rejected() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840\u{7f}10008".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();

    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU).unwrap_err();
    assert_matches!(err, ReadError::InvalidUid { .. });
}

#[test]
fn uid_padding_is_trimmed() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1\0".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2\0".to_string()],
        }],
        user_variables: vec![],
    });
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();

    let read_back = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU).unwrap();
    if let Pdu::AssociationRQ(AssociationRQ {
        presentation_contexts,
        ..
    }) = read_back
    {
        assert_eq!(presentation_contexts[0].abstract_syntax, "1.2.840.10008.1.1");
        assert_eq!(
            presentation_contexts[0].transfer_syntaxes[0],
            "1.2.840.10008.1.2"
        );
    } else {
        panic!("expected an A-ASSOCIATE-RQ");
    }
}

#[test]
fn pdu_above_the_maximum_length_is_rejected() {
    // a P-DATA-TF header declaring a body longer than the maximum
    let mut bytes = vec![0x04u8, 0x00];
    bytes.extend_from_slice(&(DEFAULT_MAX_PDU + 1).to_be_bytes());
    bytes.extend(std::iter::repeat(0u8).take(64));

    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU).unwrap_err();
    assert_matches!(err, ReadError::PduTooLarge { .. });
}

#[test]
fn unknown_user_information_sub_items_survive_roundtrip() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::Unknown(0x59, vec![1, 2, 3, 4]),
        ],
    });

    assert_eq!(roundtrip(&pdu), pdu);
}
