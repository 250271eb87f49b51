#[cfg(test)]
mod transaction_test;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun::addr::MappedAddress;
use stun::agent::TransactionId;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{Getter, Message, Setter, BINDING_REQUEST};
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;

use crate::control::{AttrControlled, AttrControlling};
use crate::error::Result;
use crate::priority::PriorityAttr;
use crate::use_candidate::{NominationAttr, UseCandidateAttr};

/// The STUN retransmission timer default (RFC 5389 §7.2.1), used as a
/// floor under the computed RTO so a quiet agent (one or two pairs
/// overall) never sends faster than the protocol minimum.
pub const STUN_TIMER_DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// One outstanding STUN request/response exchange for a candidate pair.
/// Owns the retransmission schedule (RFC 5389 §7.2.1: exponential
/// backoff up to `max_retransmissions`, then one final wait before
/// giving up) so the scheduler only has to ask "is this due" and
/// "retransmit or fail" on every tick.
pub struct StunTransaction {
    pub transaction_id: TransactionId,
    pub dest: SocketAddr,
    pub raw: Vec<u8>,

    rto: Duration,
    reliable: bool,
    reliable_timeout: Duration,
    max_retransmissions: u32,

    sent_count: u32,
    next_deadline: Instant,
    created_at: Instant,
}

/// What the scheduler should do with a transaction it finds due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Retransmit the same request body and wait again.
    Retransmit,
    /// Every retransmission has been exhausted; the check has failed.
    TimedOut,
}

impl StunTransaction {
    #[must_use]
    pub fn new(
        transaction_id: TransactionId,
        dest: SocketAddr,
        raw: Vec<u8>,
        rto: Duration,
        max_retransmissions: u32,
        reliable: bool,
        reliable_timeout: Duration,
        now: Instant,
    ) -> Self {
        let first_deadline = now + if reliable { reliable_timeout } else { rto };
        Self {
            transaction_id,
            dest,
            raw,
            rto,
            reliable,
            reliable_timeout,
            max_retransmissions,
            sent_count: 1,
            next_deadline: first_deadline,
            created_at: now,
        }
    }

    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_deadline
    }

    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Advances the transaction past a due deadline. Reliable transports
    /// get exactly one fixed-length wait (`stun_reliable_timeout`) and
    /// then time out, since TCP/TLS/HTTP-tunnel sockets already retry at
    /// a lower layer. Unreliable transports double the wait on every
    /// retransmission, RFC 5389 style, until `max_retransmissions` is
    /// exhausted.
    pub fn advance(&mut self, now: Instant) -> TransactionOutcome {
        if self.reliable {
            return TransactionOutcome::TimedOut;
        }

        if self.sent_count > self.max_retransmissions {
            return TransactionOutcome::TimedOut;
        }

        self.sent_count += 1;
        self.rto *= 2;
        self.next_deadline = now + self.rto;
        TransactionOutcome::Retransmit
    }

    #[must_use]
    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }
}

/// Computes the RTO for a new or retransmitted check, per
/// `priv_compute_conncheck_timer` in libnice: `timer_ta` times the
/// number of pairs across every stream that are currently Waiting or
/// InProgress, floored at `STUN_TIMER_DEFAULT_TIMEOUT` so a near-idle
/// agent doesn't hammer the network faster than RFC 5389 permits.
#[must_use]
pub fn compute_rto(timer_ta: Duration, active_pair_count: usize) -> Duration {
    let scaled = timer_ta * u32::try_from(active_pair_count.max(1)).unwrap_or(u32::MAX);
    scaled.max(STUN_TIMER_DEFAULT_TIMEOUT)
}

/// Everything needed to build one outbound connectivity check, kept
/// together so the scheduler's "send the next check" path and the
/// nomination controller's "re-check with USE-CANDIDATE" path share
/// one builder instead of duplicating the attribute set.
pub struct CheckRequestParams<'a> {
    pub local_ufrag: &'a str,
    pub remote_ufrag: &'a str,
    pub remote_pwd: &'a str,
    pub request_priority: u32,
    pub controlling: bool,
    pub tie_breaker: u64,
    /// Set when the controlling agent's nomination controller picked
    /// this check to carry USE-CANDIDATE (regular or aggressive mode).
    pub use_candidate: bool,
    /// Set instead of/alongside `use_candidate` when the RENOMINATION
    /// extension is negotiated: a monotonically increasing counter
    /// rather than a bare flag.
    pub nomination: Option<u32>,
}

/// Builds a Binding request for an ordinary or USE-CANDIDATE-bearing
/// connectivity check, RFC 8445 §7.1.1: USERNAME, the agent's role
/// attribute, PRIORITY, optionally USE-CANDIDATE/NOMINATION, then
/// MESSAGE-INTEGRITY and FINGERPRINT last so they cover everything
/// before them. Grounded in the teacher's `ping_candidate`/
/// `nominate_pair` message-building, unified into one function since
/// this crate's nomination controller can flag USE-CANDIDATE on any
/// check rather than only a dedicated nomination message.
pub fn build_check_request(params: &CheckRequestParams<'_>) -> Result<(Message, TransactionId)> {
    let transaction_id = TransactionId::new();
    let username = format!("{}:{}", params.remote_ufrag, params.local_ufrag);

    let mut msg = Message::new();
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(transaction_id),
        Box::new(BINDING_REQUEST),
        Box::new(Username::new(stun::attributes::ATTR_USERNAME, username)),
        Box::new(PriorityAttr(params.request_priority)),
    ];

    if params.controlling {
        setters.push(Box::new(AttrControlling(params.tie_breaker)));
    } else {
        setters.push(Box::new(AttrControlled(params.tie_breaker)));
    }

    if let Some(counter) = params.nomination {
        setters.push(Box::new(NominationAttr(counter)));
    } else if params.use_candidate {
        setters.push(Box::<UseCandidateAttr>::default());
    }

    setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
        params.remote_pwd.to_owned(),
    )));
    setters.push(Box::new(FINGERPRINT));

    msg.build(&setters)?;
    Ok((msg, transaction_id))
}

/// Builds the Binding success response to an inbound check, RFC 8445
/// §7.3.1.3: echoes the request's transaction id, carries
/// XOR-MAPPED-ADDRESS back to `remote`, and is integrity-protected with
/// the local password (the key the requester validated USERNAME
/// against).
pub fn build_success_response(request: &Message, remote: SocketAddr, local_pwd: &str) -> Result<Message> {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(request.clone()),
        Box::new(stun::message::BINDING_SUCCESS),
        Box::new(XorMappedAddress {
            ip: remote.ip(),
            port: remote.port(),
        }),
        Box::new(MessageIntegrity::new_short_term_integrity(local_pwd.to_owned())),
        Box::new(FINGERPRINT),
    ])?;
    Ok(msg)
}

/// Extracts the mapped address a success response reports, preferring
/// XOR-MAPPED-ADDRESS and falling back to the plain (non-XOR)
/// MAPPED-ADDRESS some older/legacy STUN servers and peers still send,
/// per the spec's "fallback NO-MAPPED case" for response parsing.
#[must_use]
pub fn extract_mapped_address(m: &Message) -> Option<SocketAddr> {
    let mut xor_addr = XorMappedAddress::default();
    if xor_addr.get_from(m).is_ok() {
        return Some(SocketAddr::new(xor_addr.ip, xor_addr.port));
    }

    let mut mapped = MappedAddress::default();
    if mapped.get_from(m).is_ok() {
        return Some(SocketAddr::new(mapped.ip, mapped.port));
    }

    None
}
