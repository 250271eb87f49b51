use super::*;

use stun::agent::TransactionId;
use stun::integrity::MessageIntegrity;
use stun::message::{BINDING_REQUEST, BINDING_SUCCESS};
use stun::textattrs::Username;

use crate::control::{AttrControlled, AttrControlling};
use crate::use_candidate::{NominationAttr, UseCandidateAttr};

#[test]
fn test_classify_request_response_indication() {
    let mut req = Message::new();
    req.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])
        .unwrap();
    assert_eq!(classify(&req), Inbound::Request);

    let mut resp = Message::new();
    resp.build(&[Box::new(BINDING_SUCCESS), Box::new(TransactionId::new())])
        .unwrap();
    assert_eq!(classify(&resp), Inbound::SuccessResponse);

    let mut indication = Message::new();
    indication
        .build(&[
            Box::new(stun::message::MessageType {
                method: METHOD_BINDING,
                class: CLASS_INDICATION,
            }),
            Box::new(TransactionId::new()),
        ])
        .unwrap();
    assert_eq!(classify(&indication), Inbound::Indication);
}

#[test]
fn test_first_unknown_mandatory_attribute_ignores_known_attrs() {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(Username::new(ATTR_USERNAME, "a:b".to_owned())),
        Box::<UseCandidateAttr>::default(),
    ])
    .unwrap();

    assert_eq!(first_unknown_mandatory_attribute(&m), None);
}

#[test]
fn test_first_unknown_mandatory_attribute_flags_unrecognized_required_attr() {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])
        .unwrap();
    // CHANGE-REQUEST (0x0003) is comprehension-required and not in the allow-list.
    m.add(AttrType(0x0003), &[0, 0, 0, 0]);

    assert_eq!(first_unknown_mandatory_attribute(&m), Some(0x0003));
}

#[test]
fn test_validate_request_credentials_accepts_matching_short_term() {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(Username::new(ATTR_USERNAME, "localufrag:remoteufrag".to_owned())),
        Box::new(MessageIntegrity::new_short_term_integrity("localpwd".to_owned())),
    ])
    .unwrap();

    let mut decoded = Message::new();
    decoded.write(&m.raw).unwrap();

    assert!(validate_request_credentials(&mut decoded, "localufrag:remoteufrag", b"localpwd").is_ok());
}

#[test]
fn test_validate_request_credentials_rejects_wrong_username() {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(Username::new(ATTR_USERNAME, "someoneelse:x".to_owned())),
        Box::new(MessageIntegrity::new_short_term_integrity("localpwd".to_owned())),
    ])
    .unwrap();

    let mut decoded = Message::new();
    decoded.write(&m.raw).unwrap();

    let err = validate_request_credentials(&mut decoded, "localufrag:remoteufrag", b"localpwd").unwrap_err();
    assert_eq!(err, Error::ErrUnauthorized);
}

#[test]
fn test_resolve_role_conflict_switches_when_our_tie_breaker_loses() {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(AttrControlling(10)),
    ])
    .unwrap();

    let outcome = resolve_role_conflict(&m, true, 5);
    assert_eq!(outcome, RoleConflictOutcome::SwitchRole { new_controlling: false });
}

#[test]
fn test_resolve_role_conflict_rejects_when_our_tie_breaker_wins() {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(AttrControlled(3)),
    ])
    .unwrap();

    let outcome = resolve_role_conflict(&m, false, 9);
    assert_eq!(outcome, RoleConflictOutcome::RejectRemote);
}

#[test]
fn test_resolve_role_conflict_none_when_roles_already_differ() {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(AttrControlled(3)),
    ])
    .unwrap();

    let outcome = resolve_role_conflict(&m, true, 9);
    assert_eq!(outcome, RoleConflictOutcome::None);
}

#[test]
fn test_renomination_counter_roundtrip() {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(NominationAttr(7)),
    ])
    .unwrap();

    assert_eq!(has_renomination_counter(&m), Some(7));
    assert!(!has_use_candidate(&m));
}

#[test]
fn test_build_error_response_preserves_transaction_id() {
    let mut req = Message::new();
    req.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])
        .unwrap();

    let resp = build_error_response(&req, CODE_UNKNOWN_ATTRIBUTE).unwrap();
    assert_eq!(resp.transaction_id, req.transaction_id);
    assert_eq!(resp.typ, BINDING_ERROR);
}
