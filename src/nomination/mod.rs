#[cfg(test)]
mod nomination_test;

use std::sync::Arc;
use std::time::Duration;

use crate::candidate::CandidateType;
use crate::pair::{CandidatePairState, CheckPair};
use crate::stream::Stream;
use crate::transport::SocketKind;

/// How long after the agent started a candidate of each type may be
/// nominated, RFC 8445's "acceptance criteria" left to implementations.
/// Mirrors the teacher's `*_acceptance_min_wait` fields on `AgentConfig`,
/// collected here since the nomination controller is the only consumer.
#[derive(Debug, Clone, Copy)]
pub struct AcceptanceMinWait {
    pub host: Duration,
    pub server_reflexive: Duration,
    pub peer_reflexive: Duration,
    pub relay: Duration,
}

impl Default for AcceptanceMinWait {
    fn default() -> Self {
        Self {
            host: Duration::from_secs(0),
            server_reflexive: Duration::from_secs(0),
            peer_reflexive: Duration::from_secs(0),
            relay: Duration::from_secs(0),
        }
    }
}

impl AcceptanceMinWait {
    #[must_use]
    pub fn for_type(&self, t: CandidateType) -> Duration {
        match t {
            CandidateType::Host => self.host,
            CandidateType::ServerReflexive => self.server_reflexive,
            CandidateType::PeerReflexive => self.peer_reflexive,
            CandidateType::Relay => self.relay,
            CandidateType::Unspecified => Duration::from_secs(0),
        }
    }
}

/// Whether a pair's local and remote candidates have each been
/// reachable long enough (`AcceptanceMinWait`) to be trusted as the
/// nominated pair. Mirrors `AgentInternal::is_nominatable`.
#[must_use]
pub fn is_nominatable(pair: &CheckPair, elapsed: Duration, wait: &AcceptanceMinWait) -> bool {
    elapsed > wait.for_type(pair.local.candidate_type())
        && elapsed > wait.for_type(pair.remote.candidate_type())
}

/// RFC 8445 §8: regular nomination lets the controlling agent wait for
/// every pair of a checklist to resolve before picking the best one;
/// aggressive nomination marks a pair USE-CANDIDATE the moment it
/// becomes valid, trading a possibly sub-optimal pair for faster
/// convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominationMode {
    Regular,
    Aggressive,
}

impl Default for NominationMode {
    fn default() -> Self {
        Self::Regular
    }
}

/// Drives the controlling-agent nomination decision. Holds no pair
/// state itself -- it reads `Stream`/`CheckPair` and flips
/// `use_candidate_on_next_check` -- so it can be exercised against a
/// plain `Stream` in tests without a running agent.
pub struct NominationController {
    mode: NominationMode,
    wait: AcceptanceMinWait,
    support_renomination: bool,
}

impl NominationController {
    #[must_use]
    pub fn new(mode: NominationMode, wait: AcceptanceMinWait, support_renomination: bool) -> Self {
        Self {
            mode,
            wait,
            support_renomination,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> NominationMode {
        self.mode
    }

    #[must_use]
    pub const fn supports_renomination(&self) -> bool {
        self.support_renomination
    }

    /// Finds the pair this component should nominate next, if any, and
    /// flags it so the next outgoing check on it carries USE-CANDIDATE
    /// (or a RENOMINATION counter, left to the dispatcher to attach).
    /// Only ever called on the controlling side; the controlled agent
    /// nominates nothing, it only honors USE-CANDIDATE it receives.
    ///
    /// Regular mode nominates once: if any pair on this component is
    /// already nominated, it does nothing. Aggressive mode may move the
    /// nomination to a newly valid, higher-priority pair even after an
    /// earlier one was nominated, since RENOMINATION is what makes that
    /// safe for the remote side to accept.
    ///
    /// Implements spec rules 1/2/5 (pick the highest-priority valid,
    /// nominatable pair) and rules 3/4 (prefer a pair matching the
    /// transport and endpoint of a pair already nominated, or about to
    /// be, on another component of this stream or on another stream
    /// entirely) -- rule 5 (no further conncheck evolution possible in
    /// this component) takes priority over 3/4's cross-component/stream
    /// preference, since at that point the preferred endpoint may never
    /// materialize here.
    pub async fn evaluate_component(
        &self,
        streams: &[Arc<Stream>],
        stream_id: crate::pair::StreamId,
        component_id: u16,
        elapsed: Duration,
    ) -> Option<Arc<CheckPair>> {
        let stream = streams.iter().find(|s| s.id == stream_id)?;
        let pairs = stream.pairs_for_component(component_id).await;

        let already_nominated = pairs.iter().any(|p| p.nominated());
        if already_nominated && self.mode == NominationMode::Regular {
            return None;
        }

        let evolving = pairs.iter().any(|p| {
            matches!(
                p.state(),
                CandidatePairState::Frozen | CandidatePairState::Waiting | CandidatePairState::InProgress
            )
        });

        let mut candidates: Vec<Arc<CheckPair>> = pairs
            .into_iter()
            .filter(|p| p.valid())
            .filter(|p| is_nominatable(p, elapsed, &self.wait))
            // A pair already carrying a nomination decision in flight
            // (sent, awaiting its response) isn't re-picked -- otherwise
            // every tick before that response lands would re-flag it for
            // another redundant USE-CANDIDATE send.
            .filter(|p| !p.mark_nominated_on_response())
            .collect();

        let best = if evolving {
            if let Some(endpoint) = preferred_endpoint(streams, stream_id, component_id).await {
                let matching: Vec<Arc<CheckPair>> = candidates
                    .iter()
                    .filter(|p| endpoint_matches(p, &endpoint))
                    .cloned()
                    .collect();
                if !matching.is_empty() {
                    candidates = matching;
                }
            }
            candidates.into_iter().max_by_key(|p| p.priority())?
        } else {
            candidates.into_iter().max_by_key(|p| p.priority())?
        };

        if best.nominated() {
            return None;
        }

        best.use_candidate_on_next_check
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Some(best)
    }

    /// Decides whether an inbound NOMINATION counter should take effect
    /// against a pair. A counter only ever moves forward: a value no
    /// greater than one already accepted for this pair is stale and
    /// rejected, mirroring how a monotonic USE-CANDIDATE would behave if
    /// it could be retried.
    #[must_use]
    pub fn accept_renomination(pair: &CheckPair, counter: u32) -> bool {
        u64::from(counter) > pair.nomination_counter.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Records an accepted RENOMINATION counter against a pair and
    /// marks it nominated. Caller must have already checked
    /// `accept_renomination`.
    pub fn record_renomination(pair: &CheckPair, counter: u32) {
        pair.nomination_counter
            .store(u64::from(counter), std::sync::atomic::Ordering::SeqCst);
        pair.set_nominated(true);
    }

    /// Among every pair of a component currently flagged nominated,
    /// returns the one with the highest accepted RENOMINATION counter.
    /// Used by the controlled side to pick the selected pair when more
    /// than one pair has been nominated over the life of the session.
    #[must_use]
    pub fn renomination_selected(pairs: &[Arc<CheckPair>]) -> Option<Arc<CheckPair>> {
        pairs
            .iter()
            .filter(|p| p.nominated())
            .max_by_key(|p| p.nomination_counter.load(std::sync::atomic::Ordering::SeqCst))
            .cloned()
    }
}

/// A nominated-or-about-to-nominate pair's transport and endpoint
/// (address, ignoring port, per spec rules 3/4), used to steer this
/// component's nomination toward a pair sharing the same path.
struct Endpoint {
    socket_kind: SocketKind,
    addr: std::net::IpAddr,
}

fn endpoint_matches(pair: &CheckPair, endpoint: &Endpoint) -> bool {
    pair.socket_kind == endpoint.socket_kind && pair.remote.addr().ip() == endpoint.addr
}

/// Rule 3: another component of the same stream already has a
/// nominated or about-to-nominate pair. Rule 4: failing that, any other
/// stream does. Same-stream takes precedence, per spec ordering.
async fn preferred_endpoint(streams: &[Arc<Stream>], stream_id: crate::pair::StreamId, component_id: u16) -> Option<Endpoint> {
    let active_stream = streams.iter().find(|s| s.id == stream_id)?;
    for other_component in active_stream.component_ids() {
        if other_component == component_id {
            continue;
        }
        if let Some(endpoint) = leading_endpoint(&active_stream.pairs_for_component(other_component).await) {
            return Some(endpoint);
        }
    }

    for other_stream in streams {
        if other_stream.id == stream_id {
            continue;
        }
        for other_component in other_stream.component_ids() {
            if let Some(endpoint) = leading_endpoint(&other_stream.pairs_for_component(other_component).await) {
                return Some(endpoint);
            }
        }
    }

    None
}

fn leading_endpoint(pairs: &[Arc<CheckPair>]) -> Option<Endpoint> {
    pairs
        .iter()
        .find(|p| p.nominated() || p.use_candidate_on_next_check.load(std::sync::atomic::Ordering::SeqCst))
        .map(|p| Endpoint {
            socket_kind: p.socket_kind,
            addr: p.remote.addr().ip(),
        })
}

/// Marks a pair nominated and selected once its USE-CANDIDATE check
/// succeeds (RFC 8445 §7.3.1.5, non-renomination path): a valid pair
/// that carried USE-CANDIDATE on the request that produced it becomes
/// the nominated pair outright, no counter comparison needed.
pub fn accept_use_candidate(pair: &CheckPair) {
    pair.set_nominated(true);
}
