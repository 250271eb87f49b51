
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use portable_atomic::AtomicU8;
use tokio::sync::Mutex;

use crate::candidate::Candidate;
use crate::pair::PairId;
use crate::state::ComponentState;

/// A connectivity check accepted (and answered) before it could be
/// fully resolved against a pair, buffered per RFC 8445 §7.3.1.4
/// ("trickle ICE" early checks) so it can be replayed once the missing
/// piece arrives. Two things can be missing independently: the remote
/// candidate (address not yet in this component's remote set) and the
/// remote ufrag (credentials not yet set on the stream), so this is
/// drained both when a remote candidate is added and when remote
/// credentials are set.
/// Caps the number of early checks buffered per component before
/// credentials arrive, so a flood of unauthenticated requests can't
/// grow this unboundedly. Mirrors the spec's `max_remote_candidates`
/// cap on the early-check store.
const MAX_EARLY_CHECKS: usize = 100;

pub struct EarlyCheck {
    pub remote_addr: std::net::SocketAddr,
    pub remote_ufrag: String,
    pub local_candidate_id: String,
    pub priority: u32,
    pub use_candidate: bool,
    pub nomination: Option<u32>,
    pub ice_controlling: Option<u64>,
    pub ice_controlled: Option<u64>,
    pub received_at: Instant,
}

/// One RTP/RTCP-style component of a stream: its own candidate store,
/// its own per-component state (a stream is `Connected` only once every
/// component reaches at least `Connected`), and the queue of inbound
/// checks that arrived before their remote candidate was known.
pub struct Component {
    pub id: u16,
    local_candidates: Mutex<Vec<Arc<dyn Candidate + Send + Sync>>>,
    remote_candidates: Mutex<Vec<Arc<dyn Candidate + Send + Sync>>>,
    state: AtomicU8,
    selected_pair: Mutex<Option<PairId>>,
    early_checks: Mutex<Vec<EarlyCheck>>,
}

impl Component {
    #[must_use]
    pub fn new(id: u16) -> Self {
        Self {
            id,
            local_candidates: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            state: AtomicU8::new(ComponentState::Connecting as u8),
            selected_pair: Mutex::new(None),
            early_checks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> ComponentState {
        match self.state.load(Ordering::SeqCst) {
            1 => ComponentState::Connected,
            2 => ComponentState::Ready,
            3 => ComponentState::Failed,
            _ => ComponentState::Connecting,
        }
    }

    pub fn set_state(&self, s: ComponentState) {
        let v = match s {
            ComponentState::Connecting => 0,
            ComponentState::Connected => 1,
            ComponentState::Ready => 2,
            ComponentState::Failed => 3,
        };
        self.state.store(v, Ordering::SeqCst);
    }

    pub async fn add_local_candidate(&self, c: Arc<dyn Candidate + Send + Sync>) {
        self.local_candidates.lock().await.push(c);
    }

    pub async fn add_remote_candidate(&self, c: Arc<dyn Candidate + Send + Sync>) {
        self.remote_candidates.lock().await.push(c);
    }

    pub async fn local_candidates(&self) -> Vec<Arc<dyn Candidate + Send + Sync>> {
        self.local_candidates.lock().await.clone()
    }

    pub async fn remote_candidates(&self) -> Vec<Arc<dyn Candidate + Send + Sync>> {
        self.remote_candidates.lock().await.clone()
    }

    pub async fn find_remote_candidate(
        &self,
        addr: std::net::SocketAddr,
    ) -> Option<Arc<dyn Candidate + Send + Sync>> {
        self.remote_candidates
            .lock()
            .await
            .iter()
            .find(|c| c.addr() == addr)
            .cloned()
    }

    pub async fn find_local_candidate(&self, id: &str) -> Option<Arc<dyn Candidate + Send + Sync>> {
        self.local_candidates
            .lock()
            .await
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub async fn selected_pair(&self) -> Option<PairId> {
        *self.selected_pair.lock().await
    }

    pub async fn set_selected_pair(&self, pair: Option<PairId>) {
        *self.selected_pair.lock().await = pair;
    }

    pub async fn push_early_check(&self, check: EarlyCheck) {
        let mut checks = self.early_checks.lock().await;
        if checks.len() >= MAX_EARLY_CHECKS {
            checks.remove(0);
        }
        checks.push(check);
    }

    /// Drains and returns every early check buffered for this
    /// component, for the scheduler to replay once a remote candidate
    /// set lands.
    pub async fn drain_early_checks(&self) -> Vec<EarlyCheck> {
        std::mem::take(&mut *self.early_checks.lock().await)
    }

    pub async fn has_early_checks(&self) -> bool {
        !self.early_checks.lock().await.is_empty()
    }
}
