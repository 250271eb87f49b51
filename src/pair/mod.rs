
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use portable_atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8};
use serde::Serialize;

use crate::candidate::Candidate;
use crate::transaction::StunTransaction;
use crate::transport::SocketKind;

/// Identifies a `CheckPair` within a single stream's pair arena. Never
/// shared across streams; back-pointers between pairs (the
/// other-stream/other-component lookups the nomination algorithm needs)
/// are resolved through `(StreamId, PairId)` tuples rather than `Arc`
/// cycles.
pub type PairId = usize;

/// Identifies a stream (an m-line, in SDP terms) within an `Agent`.
pub type StreamId = usize;

/// The ICE candidate-pair state, RFC 8445 §6.1.2.6, widened with the two
/// states RFC 8445 needs beyond the 4 RFC 5245 defined: `Frozen` (no
/// check has been scheduled because another pair shares its foundation
/// and is still being checked) and `Discovered` (the pair was created
/// from a peer-reflexive candidate learned mid-check rather than from
/// the initial candidate exchange).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    #[serde(rename = "frozen")]
    Frozen = 0,

    /// A check has not been performed for this pair, and can be
    /// performed as soon as it is the highest-priority Waiting pair on
    /// its checklist.
    #[serde(rename = "waiting")]
    Waiting = 1,

    /// A check has been sent for this pair, but the transaction is in
    /// progress.
    #[serde(rename = "in-progress")]
    InProgress = 2,

    /// A check for this pair was already done and failed, either never
    /// producing any response or producing an unrecoverable failure
    /// response.
    #[serde(rename = "failed")]
    Failed = 3,

    /// A check for this pair was already done and produced a successful
    /// result.
    #[serde(rename = "succeeded")]
    Succeeded = 4,

    /// The pair was synthesized from a peer-reflexive candidate
    /// discovered while processing an inbound or outbound check; it is
    /// valid but was never itself checked directly.
    #[serde(rename = "discovered")]
    Discovered = 5,
}

impl From<u8> for CandidatePairState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::InProgress,
            3 => Self::Failed,
            4 => Self::Succeeded,
            5 => Self::Discovered,
            _ => Self::Frozen,
        }
    }
}

impl Default for CandidatePairState {
    fn default() -> Self {
        Self::Frozen
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
            Self::Discovered => "discovered",
        };
        write!(f, "{s}")
    }
}

impl CandidatePairState {
    /// A pair is valid once it has either succeeded a direct check or
    /// been discovered from one (RFC 8445 §7.2.5.3.1, "valid list").
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Succeeded | Self::Discovered)
    }
}

/// A candidate pair plus the conncheck bookkeeping the scheduler, the
/// nomination controller and the STUN transaction layer need: the
/// stream/component it belongs to, whether it may be retried, whether
/// it is flagged to carry USE-CANDIDATE on its next check, and the
/// in-flight transaction (if any).
#[allow(clippy::cast_possible_truncation)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

pub struct CheckPair {
    pub id: PairId,
    pub stream_id: StreamId,
    pub component_id: u16,

    pub local: Arc<dyn Candidate + Send + Sync>,
    pub remote: Arc<dyn Candidate + Send + Sync>,

    pub(crate) socket_kind: SocketKind,

    /// The PRIORITY attribute this pair's checks carry: the priority a
    /// peer-reflexive candidate discovered from this check would have,
    /// fixed at pair-creation time (RFC 8445 §7.1.1). Independent of
    /// `priority()`, which is the pair-ordering key and changes with
    /// the agent's controlling/controlled role.
    request_priority: AtomicU32,

    state: AtomicU8,
    ice_role_controlling: AtomicBool,
    nominated: AtomicBool,

    /// Whether this pair actually represents a working path. Usually
    /// true exactly when `state` is `Succeeded` or `Discovered`, but a
    /// `Succeeded` pair whose response revealed a peer-reflexive local
    /// candidate stays `valid = false` once its `Discovered` child takes
    /// over -- the two can diverge from `state` for exactly that one
    /// tick of the pair's life, so this is tracked independently rather
    /// than derived from `state()`.
    valid: AtomicBool,

    /// Set on an `InProgress` pair when an inbound USE-CANDIDATE/
    /// NOMINATION request names it before its own transaction has
    /// resolved; consumed once the response arrives to nominate it
    /// immediately instead of waiting for another round trip.
    pub(crate) mark_nominated_on_response: AtomicBool,

    /// Set by the regular-nomination controller once the stopping
    /// criterion picks this pair; consumed by the next outgoing check,
    /// which then carries USE-CANDIDATE.
    pub(crate) use_candidate_on_next_check: AtomicBool,

    /// The highest NOMINATION counter accepted for this pair via the
    /// RENOMINATION extension; zero means "never nominated this way".
    pub(crate) nomination_counter: AtomicU64,

    /// Discovered/pruned pairs are never retried: a failure is terminal
    /// and the pair must not re-enter Waiting even on role conflict.
    /// Mirrors libnice's `retransmit` flag on `CandidateCheckPair`.
    pub(crate) retransmit: AtomicBool,

    pub(crate) binding_request_count: AtomicU16,

    /// The live transaction for this pair's most recent outgoing check,
    /// if one has not yet resolved.
    pub(crate) transaction: std::sync::Mutex<Option<StunTransaction>>,

    /// Set on a `Discovered` pair: the `Succeeded` (not valid) pair whose
    /// response revealed the peer-reflexive local candidate this pair was
    /// built from. Forms the 1:1 parent/child relation of §9's "cycle"
    /// with `succeeded_pair`, never both directions owned.
    pub(crate) succeeded_pair: std::sync::Mutex<Option<PairId>>,

    /// Set on a `Succeeded` pair once its response produced a `Discovered`
    /// peer-reflexive pair: the child pair that actually carries `valid`.
    pub(crate) discovered_pair: std::sync::Mutex<Option<PairId>>,

    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl fmt::Debug for CheckPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pair[{}] prio {} state {} {} <-> {}",
            self.id,
            self.priority(),
            self.state(),
            self.local,
            self.remote,
        )
    }
}

impl fmt::Display for CheckPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority(),
        )
    }
}

impl CheckPair {
    #[must_use]
    pub fn new(
        id: PairId,
        stream_id: StreamId,
        component_id: u16,
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
        controlling: bool,
        socket_kind: SocketKind,
    ) -> Self {
        let request_priority = crate::priority::stun_request_priority(
            local.priority(),
            crate::candidate::CandidateType::PeerReflexive.preference(),
        );
        Self {
            id,
            stream_id,
            component_id,
            local,
            remote,
            socket_kind,
            request_priority: AtomicU32::new(request_priority),
            state: AtomicU8::new(CandidatePairState::Frozen as u8),
            ice_role_controlling: AtomicBool::new(controlling),
            nominated: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            mark_nominated_on_response: AtomicBool::new(false),
            use_candidate_on_next_check: AtomicBool::new(false),
            nomination_counter: AtomicU64::new(0),
            retransmit: AtomicBool::new(true),
            binding_request_count: AtomicU16::new(0),
            transaction: std::sync::Mutex::new(None),
            succeeded_pair: std::sync::Mutex::new(None),
            discovered_pair: std::sync::Mutex::new(None),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    /// The `Succeeded` pair this `Discovered` pair was synthesized from,
    /// if any.
    #[must_use]
    pub fn succeeded_pair(&self) -> Option<PairId> {
        *self.succeeded_pair.lock().unwrap()
    }

    pub fn set_succeeded_pair(&self, id: Option<PairId>) {
        *self.succeeded_pair.lock().unwrap() = id;
    }

    /// The `Discovered` pair this `Succeeded` pair's response produced,
    /// if peer-reflexive discovery ran on it.
    #[must_use]
    pub fn discovered_pair(&self) -> Option<PairId> {
        *self.discovered_pair.lock().unwrap()
    }

    pub fn set_discovered_pair(&self, id: Option<PairId>) {
        *self.discovered_pair.lock().unwrap() = id;
    }

    /// RFC 8445 §6.1.2.3. Let G be the priority for the candidate
    /// provided by the controlling agent. Let D be the priority for the
    /// candidate provided by the controlled agent.
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    #[must_use]
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.ice_role_controlling.load(Ordering::SeqCst) {
            (self.local.priority(), self.remote.priority())
        } else {
            (self.remote.priority(), self.local.priority())
        };

        ((1_u64 << 32) - 1) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    /// Recomputes this pair's priority ordering key after a role
    /// conflict flips the agent's controlling/controlled role.
    /// `priority()` already re-derives G/D from the current role on
    /// every call, so this only needs to update the cached role flag.
    pub fn set_controlling(&self, controlling: bool) {
        self.ice_role_controlling.store(controlling, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_controlling(&self) -> bool {
        self.ice_role_controlling.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> CandidatePairState {
        CandidatePairState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, s: CandidatePairState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn nominated(&self) -> bool {
        self.nominated.load(Ordering::SeqCst)
    }

    pub fn set_nominated(&self, v: bool) {
        self.nominated.store(v, Ordering::SeqCst);
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn set_valid(&self, v: bool) {
        self.valid.store(v, Ordering::SeqCst);
    }

    #[must_use]
    pub fn mark_nominated_on_response(&self) -> bool {
        self.mark_nominated_on_response.load(Ordering::SeqCst)
    }

    pub fn set_mark_nominated_on_response(&self, v: bool) {
        self.mark_nominated_on_response.store(v, Ordering::SeqCst);
    }

    #[must_use]
    pub fn retransmit(&self) -> bool {
        self.retransmit.load(Ordering::SeqCst)
    }

    pub fn set_retransmit(&self, v: bool) {
        self.retransmit.store(v, Ordering::SeqCst);
    }

    pub fn mark_sent(&self) {
        self.last_sent.store(now_millis(), Ordering::SeqCst);
    }

    /// Records that a packet (of any kind -- a keepalive response, but
    /// also ordinary media once this pair is selected) was just received
    /// on this pair. The keepalive engine uses this to tell a keepalive
    /// timeout that legitimately found nothing from a timeout on a pair
    /// media has quietly kept alive.
    pub fn mark_received(&self) {
        self.last_received.store(now_millis(), Ordering::SeqCst);
    }

    /// Milliseconds since `mark_received` was last called, or `None` if
    /// it never has been.
    #[must_use]
    pub fn millis_since_received(&self) -> Option<u64> {
        let last = self.last_received.load(Ordering::SeqCst);
        if last == 0 {
            None
        } else {
            Some(now_millis().saturating_sub(last))
        }
    }

    /// Returns true when this pair's local and remote candidates share a
    /// transport (ignoring port) with `other`'s, which is the
    /// "same-component" compatibility test the nomination stopping
    /// criterion uses to find a pair belonging to another component of
    /// the same stream.
    /// The PRIORITY attribute this pair's checks carry, fixed at
    /// creation (see `request_priority` field docs).
    #[must_use]
    pub fn request_priority(&self) -> u32 {
        self.request_priority.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn same_transport_ignoring_port(&self, other: &CheckPair) -> bool {
        self.local.address() == other.local.address()
            && self.remote.address() == other.remote.address()
            && self.local.network_type() == other.local.network_type()
    }
}
