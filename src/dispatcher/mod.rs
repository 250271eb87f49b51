#[cfg(test)]
mod dispatcher_test;

use stun::attributes::{
    AttrType, ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_MESSAGE_INTEGRITY,
    ATTR_MESSAGE_INTEGRITY_SHA256, ATTR_PASSWORD_ALGORITHM, ATTR_PRIORITY, ATTR_REALM, ATTR_USER_HASH,
    ATTR_USERNAME, ATTR_USE_CANDIDATE,
};
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED, CODE_UNKNOWN_ATTRIBUTE};
use stun::message::{
    Getter, Message, Setter, BINDING_ERROR, CLASS_ERROR_RESPONSE, CLASS_INDICATION, CLASS_REQUEST,
    CLASS_SUCCESS_RESPONSE, METHOD_BINDING,
};
use stun::textattrs::Username;

use crate::control::{AttrControlled, AttrControlling};
use crate::error::{Error, Result};
use crate::stream::select_role_controlling;

/// What an inbound STUN datagram addressed to the agent turns out to
/// be, per RFC 8445 §7.3: only Binding requests, Binding success
/// responses and Binding indications are meaningful to connectivity
/// checks, everything else (including other STUN methods entirely) is
/// ignored without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Request,
    SuccessResponse,
    ErrorResponse,
    Indication,
    Ignored,
}

#[must_use]
pub fn classify(m: &Message) -> Inbound {
    if m.typ.method != METHOD_BINDING {
        return Inbound::Ignored;
    }
    if m.typ.class == CLASS_REQUEST {
        Inbound::Request
    } else if m.typ.class == CLASS_SUCCESS_RESPONSE {
        Inbound::SuccessResponse
    } else if m.typ.class == CLASS_ERROR_RESPONSE {
        Inbound::ErrorResponse
    } else if m.typ.class == CLASS_INDICATION {
        Inbound::Indication
    } else {
        Inbound::Ignored
    }
}

/// Reads the numeric ERROR-CODE out of an error response, if present.
#[must_use]
pub fn error_code_of(m: &Message) -> Option<u16> {
    let mut attr = ErrorCodeAttribute::default();
    if attr.get_from(m).is_ok() {
        Some(attr.code.0)
    } else {
        None
    }
}

/// Attribute types a Binding request/response/indication is allowed to
/// carry without tripping the "unknown mandatory attribute" check.
/// Anything comprehension-required (type < 0x8000, RFC 5389 §15) that
/// is not one of these is something this crate does not understand,
/// and per RFC 5389 §7.3.1 a request carrying one must be rejected
/// with 420 rather than silently processed.
const KNOWN_REQUIRED_ATTRIBUTES: &[AttrType] = &[
    ATTR_USERNAME,
    ATTR_MESSAGE_INTEGRITY,
    ATTR_MESSAGE_INTEGRITY_SHA256,
    ATTR_PRIORITY,
    ATTR_USE_CANDIDATE,
    ATTR_REALM,
    ATTR_PASSWORD_ALGORITHM,
    ATTR_USER_HASH,
];

/// Returns the first comprehension-required attribute type this crate
/// does not recognize, if any. `ICE-CONTROLLED`/`ICE-CONTROLLING` and
/// `FINGERPRINT` are comprehension-optional (0x8000 range) so they
/// never trip this, nor does the RENOMINATION `NOMINATION` attribute.
#[must_use]
pub fn first_unknown_mandatory_attribute(m: &Message) -> Option<u16> {
    m.attributes
        .0
        .iter()
        .map(|a| a.typ)
        .find(|t| t.required() && !KNOWN_REQUIRED_ATTRIBUTES.contains(t))
        .map(AttrType::value)
}

/// Validates the short-term credential on an inbound Binding request:
/// USERNAME must equal `local_ufrag:remote_ufrag` and MESSAGE-INTEGRITY
/// must check against `local_pwd`. Grounded in
/// `AgentInternal::handle_inbound`'s request branch, which performs the
/// same two checks before ever looking at the candidate pair.
pub fn validate_request_credentials(m: &mut Message, expected_username: &str, local_pwd: &[u8]) -> Result<()> {
    crate::util::assert_inbound_username(m, expected_username).map_err(|_| Error::ErrUnauthorized)?;
    crate::util::assert_inbound_message_integrity(m, local_pwd).map_err(|_| Error::ErrUnauthorized)
}

/// Validates an inbound Binding request that arrived before the remote
/// ufrag was learned (the "early incoming check" case): USERNAME can
/// only be checked for the `local_ufrag:` prefix this agent owns, since
/// the remote half is exactly the thing not yet known, but
/// MESSAGE-INTEGRITY still needs only `local_pwd` and is checked in
/// full. Returns the remote ufrag parsed out of USERNAME so the caller
/// can learn it. Grounded in the same `handle_inbound` request branch,
/// relaxed for the ordering RFC 8445 §7.3.1.3 allows (credentials may
/// be validated against a request that outruns its own signaling).
pub fn validate_request_credentials_prefix_only(m: &mut Message, local_ufrag: &str, local_pwd: &[u8]) -> Result<String> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(m).map_err(|_| Error::ErrUnauthorized)?;

    let prefix = format!("{local_ufrag}:");
    let remote_ufrag = username
        .to_string()
        .strip_prefix(&prefix)
        .map(ToOwned::to_owned)
        .ok_or(Error::ErrUnauthorized)?;

    crate::util::assert_inbound_message_integrity(m, local_pwd).map_err(|_| Error::ErrUnauthorized)?;
    Ok(remote_ufrag)
}

/// The protocol-error reply this crate sends for a bad Binding request,
/// per RFC 5389 §7.3.1 / RFC 8445 §7.3.1.1: new behavior the teacher
/// never implemented (it only ever replies with success or drops
/// silently).
#[must_use]
pub fn protocol_error_for(err: &Error) -> Option<stun::error_code::ErrorCode> {
    match err {
        Error::ErrUnauthorized => Some(CODE_UNAUTHORIZED),
        Error::ErrUnknownMandatoryAttribute(_) => Some(CODE_UNKNOWN_ATTRIBUTE),
        _ => None,
    }
}

/// Builds a Binding error response carrying `code`, with FINGERPRINT
/// but no MESSAGE-INTEGRITY: an agent that failed to validate the
/// request's credentials has no trustworthy key to sign the error
/// with either.
pub fn build_error_response(request: &Message, code: stun::error_code::ErrorCode) -> Result<Message> {
    let mut out = Message::new();
    out.build(&[
        Box::new(request.clone()),
        Box::new(BINDING_ERROR),
        Box::new(code),
        Box::new(stun::fingerprint::FINGERPRINT),
    ])?;
    Ok(out)
}

/// Outcome of checking an inbound message's role attribute against the
/// local agent's current role, RFC 8445 §7.3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleConflictOutcome {
    /// The message's role attribute (if any) is consistent with ours.
    None,
    /// Both sides claim the same role; our tie-breaker lost, so the
    /// local agent must switch roles and continue processing the
    /// request under the new role.
    SwitchRole { new_controlling: bool },
    /// Both sides claim the same role; our tie-breaker won, so the
    /// request must be rejected with 487 and our role kept.
    RejectRemote,
}

/// Detects and resolves an ICE role conflict on an inbound message.
/// Mirrors `AgentInternal::handle_inbound`'s early-return checks, but
/// returns a decision instead of dropping the message outright so the
/// caller can reply 487 per RFC 5389 §7.3.1.1 rather than staying
/// silent as the teacher does.
#[must_use]
pub fn resolve_role_conflict(m: &Message, we_are_controlling: bool, our_tie_breaker: u64) -> RoleConflictOutcome {
    let (remote_says_controlling, remote_tie_breaker) = if m.contains(ATTR_ICE_CONTROLLING) {
        let mut a = AttrControlling::default();
        if a.get_from(m).is_err() {
            return RoleConflictOutcome::None;
        }
        (true, a.0)
    } else if m.contains(ATTR_ICE_CONTROLLED) {
        let mut a = AttrControlled::default();
        if a.get_from(m).is_err() {
            return RoleConflictOutcome::None;
        }
        (false, a.0)
    } else {
        return RoleConflictOutcome::None;
    };

    if remote_says_controlling != we_are_controlling {
        return RoleConflictOutcome::None;
    }

    if select_role_controlling(our_tie_breaker, remote_tie_breaker, we_are_controlling) == we_are_controlling {
        RoleConflictOutcome::RejectRemote
    } else {
        RoleConflictOutcome::SwitchRole {
            new_controlling: !we_are_controlling,
        }
    }
}

#[must_use]
pub fn role_conflict_error() -> stun::error_code::ErrorCode {
    CODE_ROLE_CONFLICT
}

/// Whether an inbound request's NOMINATION counter (RENOMINATION
/// extension) should be read instead of the legacy USE-CANDIDATE flag.
#[must_use]
pub fn has_renomination_counter(m: &Message) -> Option<u32> {
    let mut attr = crate::use_candidate::NominationAttr::default();
    if crate::use_candidate::NominationAttr::is_set(m) && attr.get_from(m).is_ok() {
        Some(attr.0)
    } else {
        None
    }
}

#[must_use]
pub fn has_use_candidate(m: &Message) -> bool {
    m.contains(ATTR_USE_CANDIDATE)
}
