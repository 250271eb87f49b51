
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::candidate::Candidate;
use crate::component::Component;
use crate::pair::{CandidatePairState, CheckPair, PairId, StreamId};
use crate::state::ComponentState;
use crate::transport::SocketKind;

/// One m-line's worth of components and the pair arena checks run
/// against. Mirrors libnice's `Stream`/`checklist` split: every
/// component of a stream shares one arena so foundation-based
/// freeze/unfreeze and priority ordering can be computed across
/// components, while each component keeps its own candidate sets and
/// selected pair.
pub struct Stream {
    pub id: StreamId,
    components: HashMap<u16, Arc<Component>>,
    pairs: Mutex<Vec<Arc<CheckPair>>>,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId, component_ids: &[u16]) -> Self {
        let components = component_ids
            .iter()
            .map(|id| (*id, Arc::new(Component::new(*id))))
            .collect();
        Self {
            id,
            components,
            pairs: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn component(&self, id: u16) -> Option<&Arc<Component>> {
        self.components.get(&id)
    }

    pub fn components(&self) -> impl Iterator<Item = &Arc<Component>> {
        self.components.values()
    }

    #[must_use]
    pub fn component_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.components.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn pair(&self, id: PairId) -> Option<Arc<CheckPair>> {
        self.pairs.lock().await.get(id).cloned()
    }

    pub async fn pairs(&self) -> Vec<Arc<CheckPair>> {
        self.pairs.lock().await.clone()
    }

    pub async fn pairs_for_component(&self, component_id: u16) -> Vec<Arc<CheckPair>> {
        self.pairs
            .lock()
            .await
            .iter()
            .filter(|p| p.component_id == component_id)
            .cloned()
            .collect()
    }

    /// Creates the pair for `(local, remote)` on `component_id` if one
    /// does not already exist for that exact address pair, assigning
    /// its initial frozen/waiting state per RFC 8445 §6.1.2.6: the
    /// first pair seen for a given (local foundation, remote
    /// foundation) group starts `Waiting`; every later pair sharing
    /// that foundation pair starts `Frozen`. Returns the resulting
    /// pair either way.
    pub async fn get_or_create_pair(
        &self,
        component_id: u16,
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
        controlling: bool,
        socket_kind: SocketKind,
    ) -> Arc<CheckPair> {
        let mut pairs = self.pairs.lock().await;

        if let Some(existing) = pairs
            .iter()
            .find(|p| p.component_id == component_id && p.local.equal(&*local) && p.remote.equal(&*remote))
        {
            return Arc::clone(existing);
        }

        let foundation_seen = pairs
            .iter()
            .any(|p| p.local.foundation() == local.foundation() && p.remote.foundation() == remote.foundation());

        let id = pairs.len();
        let pair = Arc::new(CheckPair::new(
            id,
            self.id,
            component_id,
            local,
            remote,
            controlling,
            socket_kind,
        ));
        if !foundation_seen {
            pair.set_state(CandidatePairState::Waiting);
        }
        pairs.push(Arc::clone(&pair));
        pair
    }

    /// Registers a pair already built elsewhere (e.g. a peer-reflexive
    /// `Discovered` pair synthesized by the dispatcher) into this
    /// stream's arena, assigning it the next `PairId`. The caller must
    /// have constructed the pair with a placeholder id; this rewrites
    /// it via a fresh `CheckPair` at the correct slot since `PairId` is
    /// just the arena index.
    ///
    /// Grounded in libnice's `priv_process_response_check_for_reflexive`:
    /// if a pair for this exact `(local, remote)` tuple already exists in
    /// the arena, it is reused (marked valid) instead of inserting a
    /// second pair for the same addresses, preserving the "at most one
    /// pair per (local, remote) tuple" invariant.
    pub async fn insert_discovered(
        &self,
        component_id: u16,
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
        controlling: bool,
        socket_kind: SocketKind,
    ) -> Arc<CheckPair> {
        let mut pairs = self.pairs.lock().await;

        if let Some(existing) = pairs
            .iter()
            .find(|p| p.component_id == component_id && p.local.equal(&*local) && p.remote.equal(&*remote))
        {
            existing.set_valid(true);
            return Arc::clone(existing);
        }

        let id = pairs.len();
        let pair = Arc::new(CheckPair::new(
            id,
            self.id,
            component_id,
            local,
            remote,
            controlling,
            socket_kind,
        ));
        pair.set_state(CandidatePairState::Discovered);
        pair.set_retransmit(false);
        pair.set_valid(true);
        pairs.push(Arc::clone(&pair));
        pair
    }

    /// RFC 8445 §7.2.5.3.3 "Updating the Nominated Flag" / unfreezing:
    /// once a pair succeeds, every other `Frozen` pair in this stream
    /// sharing its (local, remote) foundation pair becomes `Waiting`,
    /// regardless of which component it belongs to.
    pub async fn unfreeze_matching_foundation(&self, succeeded: &CheckPair) {
        let pairs = self.pairs.lock().await;
        for p in pairs.iter() {
            if p.id == succeeded.id {
                continue;
            }
            if p.state() == CandidatePairState::Frozen
                && p.local.foundation() == succeeded.local.foundation()
                && p.remote.foundation() == succeeded.remote.foundation()
            {
                p.set_state(CandidatePairState::Waiting);
            }
        }
    }

    /// Unfreezes every still-frozen pair in the stream. Used when the
    /// scheduler finds no pair left `Waiting` or `InProgress` anywhere
    /// (RFC 8445 §6.1.2.6's "if there are no remaining candidate pairs
    /// in the Waiting state... the agent changes all Frozen pairs...").
    pub async fn unfreeze_all(&self) {
        let pairs = self.pairs.lock().await;
        for p in pairs.iter() {
            if p.state() == CandidatePairState::Frozen {
                p.set_state(CandidatePairState::Waiting);
            }
        }
    }

    /// Highest-priority `Waiting` pair in this stream, if any.
    pub async fn highest_priority_waiting(&self) -> Option<Arc<CheckPair>> {
        let pairs = self.pairs.lock().await;
        pairs
            .iter()
            .filter(|p| p.state() == CandidatePairState::Waiting)
            .max_by_key(|p| p.priority())
            .cloned()
    }

    #[must_use]
    pub async fn has_active_pairs(&self) -> bool {
        let pairs = self.pairs.lock().await;
        pairs.iter().any(|p| {
            matches!(
                p.state(),
                CandidatePairState::Waiting | CandidatePairState::InProgress
            )
        })
    }

    /// Caps the number of pairs kept per component at `max_pairs` by
    /// failing the lowest-priority `Frozen` pairs first. `Waiting`,
    /// `InProgress`, `Succeeded` and `Discovered` pairs are never
    /// touched by this path: a check may already be in flight, or media
    /// may already depend on them, or a check is still due to run. Any
    /// pair already `Failed` is left as-is regardless of the cap -- it
    /// is already terminal and costs nothing to keep in the arena.
    pub async fn prune(&self, max_pairs: usize) {
        let mut pairs = self.pairs.lock().await;
        for component_id in {
            let mut ids: Vec<u16> = pairs.iter().map(|p| p.component_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        } {
            let mut prunable: Vec<usize> = pairs
                .iter()
                .enumerate()
                .filter(|(_, p)| p.component_id == component_id && p.state() == CandidatePairState::Frozen)
                .map(|(i, _)| i)
                .collect();

            let total_for_component = pairs.iter().filter(|p| p.component_id == component_id).count();
            if total_for_component <= max_pairs {
                continue;
            }
            let excess = total_for_component - max_pairs;
            prunable.sort_by_key(|&i| pairs[i].priority());
            for &i in prunable.iter().take(excess.min(prunable.len())) {
                pairs[i].set_retransmit(false);
                pairs[i].set_state(CandidatePairState::Failed);
            }
        }
    }

    /// Flips the cached controlling/controlled role on every pair, for
    /// the role-conflict resolution path (§4.4): pair priorities depend
    /// on which side is controlling, so existing pairs must be
    /// re-tagged rather than just the agent-level flag.
    pub async fn set_controlling(&self, controlling: bool) {
        let pairs = self.pairs.lock().await;
        for p in pairs.iter() {
            p.set_controlling(controlling);
        }
    }

    /// True once every component of this stream has reached at least
    /// `Connected`.
    pub fn connected(&self) -> bool {
        self.components
            .values()
            .all(|c| !matches!(c.state(), ComponentState::Connecting))
    }

    pub fn failed(&self) -> bool {
        self.components
            .values()
            .all(|c| matches!(c.state(), ComponentState::Failed))
    }
}

pub(crate) fn select_role_controlling(tie_breaker_ours: u64, tie_breaker_theirs: u64, ours: bool) -> bool {
    // RFC 8445 §7.3.1.1: on a role conflict, the agent with the larger
    // tie-breaker value wins `Controlling`.
    if tie_breaker_ours == tie_breaker_theirs {
        return ours;
    }
    tie_breaker_ours > tie_breaker_theirs
}
