pub mod agent_config;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use portable_atomic::{AtomicBool, AtomicU64, AtomicU8};
use stun::agent::TransactionId;
use stun::attributes::ATTR_USERNAME;
use stun::error_code::{CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED, CODE_UNKNOWN_ATTRIBUTE};
use stun::message::{Getter, Message};
use stun::textattrs::Username;
use tokio::sync::{mpsc, Mutex};

pub use agent_config::{AgentConfig, Compatibility, StreamConfig};

use crate::candidate::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::{Candidate, CandidateType};
use crate::component::EarlyCheck;
use crate::control::Role;
use crate::dispatcher::{self, Inbound, RoleConflictOutcome};
use crate::error::{Error, Result};
use crate::gathering::GatheringCollaborator;
use crate::keepalive::{KeepaliveConfig, KeepaliveEngine};
use crate::nomination::{self, NominationController};
use crate::pair::{CandidatePairState, CheckPair, PairId, StreamId};
use crate::scheduler::{advance_transactions, Scheduler, TransactionEvent, TriggeredQueue};
use crate::stream::Stream;
use crate::transaction::{build_check_request, build_success_response, extract_mapped_address, CheckRequestParams};
use crate::transport::{socket_kind_for, Socket, SocketKind};
use crate::state::ComponentState;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fired on every component state transition (RFC 8445 §8's
/// Connecting/Connected/Ready/Failed ladder for one stream/component
/// pair).
pub type OnConnectionStateChangeHdlrFn =
    Box<dyn (FnMut(StreamId, u16, ComponentState) -> BoxFuture) + Send + Sync>;

/// Fired once a component's selected pair changes (first selection, or
/// a later renomination superseding it).
pub type OnSelectedCandidatePairChangeHdlrFn = Box<
    dyn (FnMut(StreamId, u16, Arc<dyn Candidate + Send + Sync>, Arc<dyn Candidate + Send + Sync>) -> BoxFuture)
        + Send
        + Sync,
>;

/// Fired when a local candidate is learned mid-session: a peer-reflexive
/// local candidate discovered from a check response, surfaced so the
/// host application's signaling layer can trickle it out.
pub type OnCandidateHdlrFn = Box<dyn (FnMut(u16, Arc<dyn Candidate + Send + Sync>) -> BoxFuture) + Send + Sync>;

/// Fired the first time a Binding request arrives on a component before
/// this agent has sent one of its own -- the controlled peer's signal
/// that it may now answer with ICE even though its own checklist hasn't
/// started yet.
pub type OnBindingRequestReceivedHdlrFn = Box<dyn (FnMut(StreamId, u16) -> BoxFuture) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_connection_state_change: ArcSwapOption<Mutex<OnConnectionStateChangeHdlrFn>>,
    on_selected_candidate_pair_change: ArcSwapOption<Mutex<OnSelectedCandidatePairChangeHdlrFn>>,
    on_candidate: ArcSwapOption<Mutex<OnCandidateHdlrFn>>,
    on_binding_request_received: ArcSwapOption<Mutex<OnBindingRequestReceivedHdlrFn>>,
}

/// The ICE connectivity-check engine: owns the per-stream pair arenas,
/// the scheduler/triggered-check queue, and the nomination/keepalive
/// controllers, and drives them from a background tick loop. Candidate
/// gathering and socket I/O are the host application's job (see
/// `GatheringCollaborator`/`Socket`); this only ever runs checks against
/// candidates and sockets it is handed.
pub struct Agent {
    local_ufrag: String,
    local_pwd: String,
    tie_breaker: u64,
    controlling: AtomicBool,
    compatibility: Compatibility,
    lite: bool,
    support_renomination: bool,
    max_pairs_per_component: usize,
    check_interval: Duration,

    streams: Vec<Arc<Stream>>,
    gatherer: Arc<dyn GatheringCollaborator>,
    sockets: Mutex<HashMap<String, Arc<dyn Socket>>>,

    remote_credentials: Mutex<Option<(String, String)>>,

    scheduler: Scheduler,
    triggered: TriggeredQueue,
    nomination: NominationController,
    keepalive: KeepaliveEngine,
    /// How long a keepalive may go unanswered, with no ordinary media
    /// arriving either, before the owning component is failed outright.
    keepalive_fatal_timeout: Duration,

    renomination_counter: AtomicU64,
    connection_state: AtomicU8,

    handlers: Handlers,

    force_contact_tx: mpsc::Sender<()>,
    force_contact_rx: Mutex<Option<mpsc::Receiver<()>>>,
    running: AtomicBool,

    started_at: Instant,
}

impl Agent {
    /// Builds the agent's streams/components and starting configuration.
    /// Does not start the background tick loop -- call `run` for that,
    /// once handlers are registered.
    pub fn new(mut config: AgentConfig, gatherer: Arc<dyn GatheringCollaborator>) -> Result<Arc<Self>> {
        if config.local_ufrag.is_empty() {
            config.local_ufrag = crate::rand::generate_ufrag();
        }
        if config.local_pwd.is_empty() {
            config.local_pwd = crate::rand::generate_pwd();
        }
        if config.local_ufrag.len() * 8 < 24 {
            return Err(Error::ErrLocalUfragInsufficientBits);
        }
        if config.local_pwd.len() * 8 < 128 {
            return Err(Error::ErrLocalPwdInsufficientBits);
        }

        let now = Instant::now();
        let streams = config
            .streams
            .iter()
            .map(|s| Arc::new(Stream::new(s.id, &s.component_ids)))
            .collect();

        let acceptance_min_wait = config.acceptance_min_wait();
        let scheduler_config = config.scheduler_config();
        let check_interval = scheduler_config.timer_ta;
        let max_pairs_per_component = config.max_pairs_per_component();
        let keepalive = KeepaliveEngine::new(KeepaliveConfig {
            interval: config.keepalive_interval.unwrap_or(crate::keepalive::DEFAULT_KEEPALIVE_INTERVAL),
            conncheck: config.keepalive_conncheck,
        });
        let keepalive_fatal_timeout =
            2 * config.keepalive_interval.unwrap_or(crate::keepalive::DEFAULT_KEEPALIVE_INTERVAL);

        let (force_contact_tx, force_contact_rx) = mpsc::channel(1);

        Ok(Arc::new(Self {
            local_ufrag: config.local_ufrag,
            local_pwd: config.local_pwd,
            tie_breaker: rand::random::<u64>(),
            controlling: AtomicBool::new(config.is_controlling),
            compatibility: config.compatibility,
            lite: config.lite,
            support_renomination: config.support_renomination,
            max_pairs_per_component,
            check_interval,

            streams,
            gatherer,
            sockets: Mutex::new(HashMap::new()),

            remote_credentials: Mutex::new(None),

            scheduler: Scheduler::new(scheduler_config, now),
            triggered: TriggeredQueue::new(),
            nomination: NominationController::new(config.nomination_mode, acceptance_min_wait, config.support_renomination),
            keepalive,
            keepalive_fatal_timeout,

            renomination_counter: AtomicU64::new(0),
            connection_state: AtomicU8::new(ComponentState::Connecting as u8),

            handlers: Handlers::default(),

            force_contact_tx,
            force_contact_rx: Mutex::new(Some(force_contact_rx)),
            running: AtomicBool::new(false),

            started_at: now,
        }))
    }

    #[must_use]
    pub fn local_ufrag(&self) -> &str {
        &self.local_ufrag
    }

    #[must_use]
    pub fn local_pwd(&self) -> &str {
        &self.local_pwd
    }

    #[must_use]
    pub fn is_controlling(&self) -> bool {
        self.controlling.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn role(&self) -> Role {
        if self.is_controlling() {
            Role::Controlling
        } else {
            Role::Controlled
        }
    }

    // -- Handler registration ------------------------------------------

    pub fn on_connection_state_change(&self, f: OnConnectionStateChangeHdlrFn) {
        self.handlers.on_connection_state_change.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_selected_candidate_pair_change(&self, f: OnSelectedCandidatePairChangeHdlrFn) {
        self.handlers
            .on_selected_candidate_pair_change
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_candidate(&self, f: OnCandidateHdlrFn) {
        self.handlers.on_candidate.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_binding_request_received(&self, f: OnBindingRequestReceivedHdlrFn) {
        self.handlers.on_binding_request_received.store(Some(Arc::new(Mutex::new(f))));
    }

    async fn fire_state_change(&self, stream_id: StreamId, component_id: u16, state: ComponentState) {
        if let Some(handler) = &*self.handlers.on_connection_state_change.load() {
            (handler.lock().await)(stream_id, component_id, state).await;
        }
    }

    async fn fire_pair_change(
        &self,
        stream_id: StreamId,
        component_id: u16,
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
    ) {
        if let Some(handler) = &*self.handlers.on_selected_candidate_pair_change.load() {
            (handler.lock().await)(stream_id, component_id, local, remote).await;
        }
    }

    async fn fire_candidate(&self, component_id: u16, c: Arc<dyn Candidate + Send + Sync>) {
        if let Some(handler) = &*self.handlers.on_candidate.load() {
            (handler.lock().await)(component_id, c).await;
        }
    }

    async fn fire_binding_request_received(&self, stream_id: StreamId, component_id: u16) {
        if let Some(handler) = &*self.handlers.on_binding_request_received.load() {
            (handler.lock().await)(stream_id, component_id).await;
        }
    }

    fn stream(&self, stream_id: StreamId) -> Result<&Arc<Stream>> {
        self.streams.get(stream_id).ok_or(Error::ErrUnknownStreamOrComponent)
    }

    // -- Agent-level outputs ---------------------------------------------

    /// Registers a newly gathered local candidate against `component_id`
    /// of `stream_id`, pairing it with every compatible remote candidate
    /// already known on that component. `force_relay` (if set) silently
    /// drops anything but relay candidates, per RFC 8445's all-relay
    /// deployment mode.
    pub async fn conn_check_add_for_local_candidate(
        &self,
        stream_id: StreamId,
        component_id: u16,
        local: Arc<dyn Candidate + Send + Sync>,
        socket: Arc<dyn Socket>,
        force_relay: bool,
    ) -> Result<()> {
        if force_relay && local.candidate_type() != CandidateType::Relay {
            return Ok(());
        }

        let stream = self.stream(stream_id)?;
        let component = stream.component(component_id).ok_or(Error::ErrUnknownStreamOrComponent)?;

        let kind = socket.kind();
        if kind != socket_kind_for(&*local) {
            return Err(Error::ErrIncompatibleSocketKind);
        }

        self.sockets.lock().await.insert(local.id(), socket);
        component.add_local_candidate(Arc::clone(&local)).await;

        for remote in component.remote_candidates().await {
            if !kind.is_compatible_with(socket_kind_for(&*remote)) {
                continue;
            }
            stream
                .get_or_create_pair(component_id, Arc::clone(&local), remote, self.is_controlling(), kind)
                .await;
        }

        stream.prune(self.max_pairs_per_component).await;
        self.replay_early_checks_for_local(stream, &local, kind).await;
        self.request_connectivity_check();
        Ok(())
    }

    /// Registers a remote candidate (learned from signaling) against
    /// `component_id` of `stream_id`, pairing it with every compatible
    /// local candidate already gathered there.
    pub async fn conn_check_add_for_candidate(
        &self,
        stream_id: StreamId,
        component_id: u16,
        remote: Arc<dyn Candidate + Send + Sync>,
    ) -> Result<()> {
        let stream = self.stream(stream_id)?;
        let component = stream.component(component_id).ok_or(Error::ErrUnknownStreamOrComponent)?;

        if let Some(existing) = component.find_remote_candidate(remote.addr()).await {
            if existing.equal(&*remote) {
                return Ok(());
            }
        }
        component.add_remote_candidate(Arc::clone(&remote)).await;

        let sockets = self.sockets.lock().await.clone();
        for local in component.local_candidates().await {
            let Some(socket) = sockets.get(&local.id()) else { continue };
            if !socket.kind().is_compatible_with(socket_kind_for(&*remote)) {
                continue;
            }
            stream
                .get_or_create_pair(component_id, local, Arc::clone(&remote), self.is_controlling(), socket.kind())
                .await;
        }

        stream.prune(self.max_pairs_per_component).await;
        self.replay_early_checks_for_remote(stream, component_id, &remote).await;
        self.request_connectivity_check();
        Ok(())
    }

    /// Learns the remote ufrag/pwd for the whole agent (RFC 8445's
    /// credentials are per-session, not per-stream) and drains every
    /// early check buffered while they were unknown -- capped at
    /// `max_remote_candidates` per the spec's early-check store budget.
    pub async fn conn_check_remote_credentials_set(&self, remote_ufrag: String, remote_pwd: String) {
        if remote_ufrag.is_empty() || remote_pwd.is_empty() {
            return;
        }
        *self.remote_credentials.lock().await = Some((remote_ufrag, remote_pwd));

        for stream in &self.streams {
            for component_id in stream.component_ids() {
                let Some(component) = stream.component(component_id) else { continue };
                for check in component.drain_early_checks().await {
                    self.replay_early_check(stream, component_id, check).await;
                }
            }
        }
        self.request_connectivity_check();
    }

    /// Forgets a stream's pairs, for a remote m-line that has been
    /// removed or rejected. Selected-pair/connection state is left to
    /// settle on the next tick.
    pub async fn conn_check_prune_stream(&self, stream_id: StreamId) -> Result<()> {
        let stream = self.stream(stream_id)?;
        stream.prune(0).await;
        Ok(())
    }

    /// Forgets a socket, e.g. once the host application has torn it
    /// down. Pairs referencing it are left to fail on their own
    /// retransmission timers rather than being force-failed here, since
    /// the socket may still have an in-flight response queued.
    pub async fn conn_check_prune_socket(&self, local_candidate_id: &str) {
        self.sockets.lock().await.remove(local_candidate_id);
    }

    /// Feeds one inbound datagram, already known to be a STUN message,
    /// into the dispatcher. Never returns an error to the caller for a
    /// protocol-level problem (unauthenticated, malformed, unknown
    /// attribute): those are handled internally per the spec's error
    /// model and only logged.
    pub async fn conn_check_handle_inbound_stun(
        self: &Arc<Self>,
        stream_id: StreamId,
        component_id: u16,
        socket: &Arc<dyn Socket>,
        from: SocketAddr,
        bytes: &[u8],
    ) -> Result<()> {
        let mut m = Message::new();
        if m.unmarshal_binary(bytes).is_err() {
            return Ok(());
        }

        match dispatcher::classify(&m) {
            Inbound::Request => self.handle_request(stream_id, component_id, socket, from, &mut m).await,
            Inbound::SuccessResponse => self.handle_success_response(stream_id, component_id, from, &m).await,
            Inbound::ErrorResponse => self.handle_error_response(stream_id, component_id, &m).await,
            Inbound::Indication | Inbound::Ignored => Ok(()),
        }
    }

    // -- Inbound handling --------------------------------------------

    async fn handle_request(
        self: &Arc<Self>,
        stream_id: StreamId,
        component_id: u16,
        socket: &Arc<dyn Socket>,
        from: SocketAddr,
        m: &mut Message,
    ) -> Result<()> {
        let stream = self.stream(stream_id)?;
        let component = stream.component(component_id).ok_or(Error::ErrUnknownStreamOrComponent)?;

        if let Some(unknown) = dispatcher::first_unknown_mandatory_attribute(m) {
            let resp = dispatcher::build_error_response(m, CODE_UNKNOWN_ATTRIBUTE)?;
            let _ = socket.send_to(&resp.marshal_binary()?, from).await;
            log::debug!("rejecting request with unknown mandatory attribute {unknown}");
            return Ok(());
        }

        match dispatcher::resolve_role_conflict(m, self.is_controlling(), self.tie_breaker) {
            RoleConflictOutcome::RejectRemote => {
                let resp = dispatcher::build_error_response(m, dispatcher::role_conflict_error())?;
                let _ = socket.send_to(&resp.marshal_binary()?, from).await;
                return Ok(());
            }
            RoleConflictOutcome::SwitchRole { new_controlling } => {
                self.controlling.store(new_controlling, Ordering::SeqCst);
                for s in &self.streams {
                    s.set_controlling(new_controlling).await;
                }
            }
            RoleConflictOutcome::None => {}
        }

        let remote_ufrag_known = self.remote_credentials.lock().await.clone();
        let remote_ufrag = match &remote_ufrag_known {
            Some((remote_ufrag, _)) => {
                let expected = format!("{}:{}", self.local_ufrag, remote_ufrag);
                if dispatcher::validate_request_credentials(m, &expected, self.local_pwd.as_bytes()).is_err() {
                    let resp = dispatcher::build_error_response(m, CODE_UNAUTHORIZED)?;
                    let _ = socket.send_to(&resp.marshal_binary()?, from).await;
                    return Ok(());
                }
                remote_ufrag.clone()
            }
            None => {
                match dispatcher::validate_request_credentials_prefix_only(m, &self.local_ufrag, self.local_pwd.as_bytes()) {
                    Ok(ufrag) => ufrag,
                    Err(_) => {
                        let resp = dispatcher::build_error_response(m, CODE_UNAUTHORIZED)?;
                        let _ = socket.send_to(&resp.marshal_binary()?, from).await;
                        return Ok(());
                    }
                }
            }
        };

        let mut priority_attr = crate::priority::PriorityAttr::default();
        let priority = if priority_attr.get_from(m).is_ok() { priority_attr.0 } else { 0 };
        let use_candidate = dispatcher::has_use_candidate(m);
        let nomination = dispatcher::has_renomination_counter(m);

        // Always reply success first: RFC 8445 §7.3.1.3/§7.3.1.4 requires
        // the responder to answer before it necessarily has a matching
        // pair (or even a matching remote candidate) yet.
        let resp = build_success_response(m, from, &self.local_pwd)?;
        let _ = socket.send_to(&resp.marshal_binary()?, from).await;

        if component.selected_pair().await.is_none() && !component.has_early_checks().await {
            self.fire_binding_request_received(stream_id, component_id).await;
        }

        let remote_known = remote_ufrag_known.is_some();
        if !remote_known {
            component
                .push_early_check(EarlyCheck {
                    remote_addr: from,
                    remote_ufrag,
                    local_candidate_id: self.socket_local_candidate_id(&component, socket).await,
                    priority,
                    use_candidate,
                    nomination,
                    ice_controlling: None,
                    ice_controlled: None,
                    received_at: Instant::now(),
                })
                .await;
            return Ok(());
        }

        let Some(local) = self.socket_owning_candidate(&component, socket).await else {
            return Ok(());
        };

        // RFC 8445 §7.3.1.4: a request from a source address that matches
        // no known remote candidate gets a peer-reflexive one synthesized
        // on the spot, with the request's own PRIORITY attribute and the
        // receiving local candidate as its base.
        let remote_candidate = match component.find_remote_candidate(from).await {
            Some(existing) => existing,
            None => {
                let network = if local.network_type().is_tcp() { "tcp" } else { "udp" };
                let config = CandidatePeerReflexiveConfig {
                    base_config: CandidateBaseConfig {
                        network: network.to_owned(),
                        address: from.ip().to_string(),
                        port: from.port(),
                        component: component_id,
                        priority,
                        ..CandidateBaseConfig::default()
                    },
                    rel_addr: local.address(),
                    rel_port: local.port(),
                };
                let Ok(base) = config.new_candidate_peer_reflexive() else {
                    return Ok(());
                };
                let synthesized: Arc<dyn Candidate + Send + Sync> = Arc::new(base);
                component.add_remote_candidate(Arc::clone(&synthesized)).await;
                self.gatherer
                    .add_peer_reflexive_local(component_id, Arc::clone(&local), from, priority)
                    .await;
                synthesized
            }
        };

        let pair = stream
            .get_or_create_pair(component_id, local, remote_candidate, self.is_controlling(), socket.kind())
            .await;
        self.apply_inbound_nomination(&pair, use_candidate, nomination);
        self.triggered.push(stream_id, pair.id).await;
        self.settle_component(stream, component_id).await;
        self.scheduler.touch(Instant::now()).await;

        Ok(())
    }

    fn apply_inbound_nomination(&self, pair: &Arc<CheckPair>, use_candidate: bool, nomination: Option<u32>) {
        if let Some(counter) = nomination {
            if nomination::NominationController::accept_renomination(pair, counter) {
                if pair.state() == CandidatePairState::InProgress {
                    pair.mark_nominated_on_response.store(true, Ordering::SeqCst);
                } else if pair.valid() {
                    nomination::NominationController::record_renomination(pair, counter);
                }
            }
        } else if use_candidate {
            if pair.state() == CandidatePairState::InProgress {
                pair.mark_nominated_on_response.store(true, Ordering::SeqCst);
            } else if pair.valid() && !self.is_controlling() {
                nomination::accept_use_candidate(pair);
            }
        }
    }

    async fn replay_early_check(&self, stream: &Arc<Stream>, component_id: u16, check: EarlyCheck) {
        let Some(component) = stream.component(component_id) else { return };
        let remote_known = self.remote_credentials.lock().await.is_some();
        let Some(remote) = component.find_remote_candidate(check.remote_addr).await else {
            if remote_known {
                component.push_early_check(check).await;
            }
            return;
        };
        if !remote_known {
            component.push_early_check(check).await;
            return;
        }

        let Some(local) = component.find_local_candidate(&check.local_candidate_id).await else {
            return;
        };
        let Some(socket) = self.sockets.lock().await.get(&check.local_candidate_id).cloned() else {
            return;
        };

        let pair = stream
            .get_or_create_pair(component_id, local, remote, self.is_controlling(), socket.kind())
            .await;
        self.apply_inbound_nomination(&pair, check.use_candidate, check.nomination);
        self.triggered.push(stream.id, pair.id).await;
        self.settle_component(stream, component_id).await;
    }

    async fn replay_early_checks_for_local(&self, stream: &Arc<Stream>, local: &Arc<dyn Candidate + Send + Sync>, _kind: SocketKind) {
        for component_id in stream.component_ids() {
            let Some(component) = stream.component(component_id) else { continue };
            let checks = component.drain_early_checks().await;
            for check in checks {
                if check.local_candidate_id == local.id() {
                    self.replay_early_check(stream, component_id, check).await;
                } else {
                    component.push_early_check(check).await;
                }
            }
        }
    }

    async fn replay_early_checks_for_remote(
        &self,
        stream: &Arc<Stream>,
        component_id: u16,
        remote: &Arc<dyn Candidate + Send + Sync>,
    ) {
        let Some(component) = stream.component(component_id) else { return };
        let checks = component.drain_early_checks().await;
        for check in checks {
            if check.remote_addr == remote.addr() {
                self.replay_early_check(stream, component_id, check).await;
            } else {
                component.push_early_check(check).await;
            }
        }
    }

    async fn handle_success_response(
        self: &Arc<Self>,
        stream_id: StreamId,
        component_id: u16,
        from: SocketAddr,
        m: &Message,
    ) -> Result<()> {
        let stream = self.stream(stream_id)?;
        let pairs = stream.pairs_for_component(component_id).await;
        let Some(pair) = pairs.into_iter().find(|p| {
            p.transaction
                .lock()
                .map(|g| g.as_ref().map(|t| t.transaction_id) == Some(m.transaction_id))
                .unwrap_or(false)
        }) else {
            return Ok(());
        };

        if pair.remote.addr() != from {
            pair.set_state(CandidatePairState::Failed);
            *pair.transaction.lock().expect("transaction lock poisoned") = None;
            return Ok(());
        }

        let remote_pwd = self.remote_credentials.lock().await.clone().map(|(_, pwd)| pwd);
        let mut m = m.clone();
        if let Some(pwd) = &remote_pwd {
            if crate::util::assert_inbound_message_integrity(&mut m, pwd.as_bytes()).is_err() {
                pair.set_state(CandidatePairState::Failed);
                *pair.transaction.lock().expect("transaction lock poisoned") = None;
                return Ok(());
            }
        }

        *pair.transaction.lock().expect("transaction lock poisoned") = None;
        pair.set_state(CandidatePairState::Succeeded);
        pair.set_valid(true);
        pair.mark_received();
        stream.unfreeze_matching_foundation(&pair).await;

        if pair.mark_nominated_on_response() {
            nomination::accept_use_candidate(&pair);
        }

        if let Some(mapped) = extract_mapped_address(&m) {
            if mapped != pair.local.addr() {
                self.discover_local_peer_reflexive(&stream, &pair, mapped).await;
            }
        }

        self.settle_component(&stream, component_id).await;
        self.scheduler.touch(Instant::now()).await;
        Ok(())
    }

    /// Grounded in libnice's `priv_process_response_check_for_reflexive`:
    /// the mapped address from a success response is matched against
    /// *all* of the component's local candidates on a compatible socket,
    /// not just the pair's own local candidate -- the mapped address may
    /// coincide with a different candidate already gathered for this
    /// component. Only when no local candidate already owns that address
    /// is a new peer-reflexive candidate synthesized.
    async fn discover_local_peer_reflexive(&self, stream: &Arc<Stream>, succeeded: &Arc<CheckPair>, mapped: SocketAddr) {
        let Some(component) = stream.component(succeeded.component_id) else { return };

        let existing_local = component
            .local_candidates()
            .await
            .into_iter()
            .find(|c| c.addr() == mapped && c.network_type().is_tcp() == succeeded.local.network_type().is_tcp());

        let new_local: Arc<dyn Candidate + Send + Sync> = if let Some(existing) = existing_local {
            existing
        } else {
            let network = if succeeded.local.network_type().is_tcp() { "tcp" } else { "udp" };
            let config = CandidatePeerReflexiveConfig {
                base_config: CandidateBaseConfig {
                    network: network.to_owned(),
                    address: mapped.ip().to_string(),
                    port: mapped.port(),
                    component: succeeded.component_id,
                    priority: succeeded.request_priority(),
                    ..CandidateBaseConfig::default()
                },
                rel_addr: succeeded.local.address(),
                rel_port: succeeded.local.port(),
            };

            let Ok(base) = config.new_candidate_peer_reflexive() else { return };
            let candidate: Arc<dyn Candidate + Send + Sync> = Arc::new(base);
            component.add_local_candidate(Arc::clone(&candidate)).await;
            self.fire_candidate(succeeded.component_id, Arc::clone(&candidate)).await;
            candidate
        };

        // `insert_discovered` itself reuses any existing (local, remote)
        // pair for this tuple, so this is safe to call even when
        // `new_local` matched an already-gathered candidate.
        let discovered = stream
            .insert_discovered(
                succeeded.component_id,
                Arc::clone(&new_local),
                Arc::clone(&succeeded.remote),
                self.is_controlling(),
                succeeded.socket_kind,
            )
            .await;
        succeeded.set_valid(false);
        succeeded.set_discovered_pair(Some(discovered.id));
        discovered.set_succeeded_pair(Some(succeeded.id));
        if succeeded.nominated() {
            discovered.set_nominated(true);
        }

        self.gatherer
            .add_server_reflexive_or_relay(succeeded.component_id, succeeded.socket_kind, Arc::clone(&succeeded.local), mapped)
            .await;
    }

    async fn handle_error_response(&self, stream_id: StreamId, component_id: u16, m: &Message) -> Result<()> {
        let stream = self.stream(stream_id)?;
        let pairs = stream.pairs_for_component(component_id).await;
        let Some(pair) = pairs.into_iter().find(|p| {
            p.transaction
                .lock()
                .map(|g| g.as_ref().map(|t| t.transaction_id) == Some(m.transaction_id))
                .unwrap_or(false)
        }) else {
            return Ok(());
        };

        if dispatcher::error_code_of(m) == Some(CODE_ROLE_CONFLICT.0) {
            let new_controlling = !self.is_controlling();
            self.controlling.store(new_controlling, Ordering::SeqCst);
            for s in &self.streams {
                s.set_controlling(new_controlling).await;
            }
            *pair.transaction.lock().expect("transaction lock poisoned") = None;
            if pair.retransmit() {
                pair.set_state(CandidatePairState::Waiting);
                self.triggered.push(stream_id, pair.id).await;
            } else {
                pair.set_state(CandidatePairState::Failed);
                self.settle_component(&stream, component_id).await;
            }
            return Ok(());
        }

        pair.set_state(CandidatePairState::Failed);
        *pair.transaction.lock().expect("transaction lock poisoned") = None;
        self.settle_component(&stream, component_id).await;
        Ok(())
    }

    /// Drives a component's Connected/Ready transitions on every inbound
    /// STUN event. Does **not** declare a component Failed: §4.6 requires
    /// FAILED only once the scheduler has reached idle, which
    /// `run_failure_sweep` (gated on `scheduler.is_idle`) alone is
    /// responsible for -- this function fires eagerly on every response/
    /// request, so an unconditional Failed transition here would make
    /// that idle gate dead for the common case.
    async fn settle_component(&self, stream: &Arc<Stream>, component_id: u16) {
        let Some(component) = stream.component(component_id) else { return };
        let pairs = stream.pairs_for_component(component_id).await;

        if let Some(selected) = nomination::NominationController::renomination_selected(&pairs) {
            let current = component.selected_pair().await;
            if current != Some(selected.id) {
                component.set_selected_pair(Some(selected.id)).await;
                component.set_state(ComponentState::Connected);
                self.fire_state_change(stream.id, component_id, ComponentState::Connected).await;
                self.fire_pair_change(stream.id, component_id, Arc::clone(&selected.local), Arc::clone(&selected.remote))
                    .await;
                // §4.6 over-nomination precondition: don't settle to Ready
                // while a higher-or-equal priority pair is still in flight
                // -- it may yet succeed and supersede this selection.
                let draining = pairs
                    .iter()
                    .any(|p| p.state() == CandidatePairState::InProgress && p.priority() >= selected.priority());
                if stream.connected() && !draining {
                    component.set_state(ComponentState::Ready);
                    self.fire_state_change(stream.id, component_id, ComponentState::Ready).await;
                }
            }
            return;
        }

        let any_valid = pairs.iter().any(|p| p.valid());
        if any_valid && component.state() == ComponentState::Connecting {
            component.set_state(ComponentState::Connected);
            self.fire_state_change(stream.id, component_id, ComponentState::Connected).await;
        }
    }

    // -- Scheduler loop --------------------------------------------------

    /// Starts (or re-drives) a check on `pair`: computes the RENOMINATION
    /// counter if applicable, builds the request, sends it, and arms the
    /// retransmission transaction.
    async fn start_check(&self, stream: &Arc<Stream>, pair: &Arc<CheckPair>) -> Result<()> {
        let Some((remote_ufrag, remote_pwd)) = self.remote_credentials.lock().await.clone() else {
            return Err(Error::ErrRemoteUfragEmpty);
        };
        let Some(socket) = self.sockets.lock().await.get(&pair.local.id()).cloned() else {
            return Err(Error::ErrIncompatibleSocketKind);
        };

        let use_candidate = pair.use_candidate_on_next_check.swap(false, Ordering::SeqCst);
        let nomination = if use_candidate && self.support_renomination {
            Some(self.renomination_counter.fetch_add(1, Ordering::SeqCst) as u32 + 1)
        } else {
            None
        };
        // We are the side choosing to nominate this pair, so the decision
        // doesn't wait on anything the remote says: flag it now so the
        // matching success response finalizes nomination on our side too.
        if use_candidate {
            pair.mark_nominated_on_response.store(true, Ordering::SeqCst);
            if let Some(counter) = nomination {
                pair.nomination_counter.store(u64::from(counter), Ordering::SeqCst);
            }
        }

        let (msg, transaction_id) = build_check_request(&CheckRequestParams {
            local_ufrag: &self.local_ufrag,
            remote_ufrag: &remote_ufrag,
            remote_pwd: &remote_pwd,
            request_priority: pair.request_priority(),
            controlling: self.is_controlling(),
            tie_breaker: self.tie_breaker,
            use_candidate,
            nomination,
        })?;

        let raw = msg.marshal_binary()?;
        let dest = pair.remote.addr();
        let _ = socket.send_to(&raw, dest).await;
        pair.mark_sent();
        pair.binding_request_count.fetch_add(1, Ordering::SeqCst);

        let active = {
            let mut n = 0usize;
            for s in &self.streams {
                n += s.pairs().await.iter().filter(|p| matches!(p.state(), CandidatePairState::Waiting | CandidatePairState::InProgress)).count();
            }
            n
        };
        let rto = self.scheduler.rto(active);
        let txn = crate::transaction::StunTransaction::new(
            transaction_id,
            dest,
            raw,
            rto,
            u32::from(self.scheduler.max_conn_checks()),
            pair.socket_kind.reliable(),
            crate::transaction::STUN_TIMER_DEFAULT_TIMEOUT,
            Instant::now(),
        );
        *pair.transaction.lock().expect("transaction lock poisoned") = Some(txn);
        pair.set_state(CandidatePairState::InProgress);
        let _ = stream;
        Ok(())
    }

    /// One scheduler tick. Ordering (spec §5): triggered checks strictly
    /// precede ordinary ones, and at most one new STUN request goes out
    /// per tick across the whole agent, whether it came from the
    /// triggered queue, a retransmission, or the ordinary Waiting sweep.
    pub async fn tick(self: &Arc<Self>) {
        if self.lite {
            self.run_nomination_and_keepalive().await;
            return;
        }

        let now = Instant::now();

        while let Some((stream_id, pair_id)) = self.triggered.pop().await {
            let Ok(stream) = self.stream(stream_id) else { continue };
            let Some(pair) = stream.pair(pair_id).await else { continue };
            if pair.state() == CandidatePairState::Failed {
                // §4.7: a Failed pair named by a fresh inbound request is
                // re-activated and retried, signaling its component back
                // from FAILED/READY to CONNECTING/CONNECTED -- but only if
                // it is still retransmittable. A non-retransmittable pair
                // (Discovered/pruned) stays Failed for good, per the
                // pinned-down Open Question in DESIGN.md.
                if !pair.retransmit() {
                    continue;
                }
                pair.set_state(CandidatePairState::Waiting);
                if let Some(component) = stream.component(pair.component_id) {
                    if matches!(component.state(), ComponentState::Failed | ComponentState::Ready) {
                        component.set_state(ComponentState::Connecting);
                        self.fire_state_change(stream_id, pair.component_id, ComponentState::Connecting).await;
                    }
                }
            }
            // A Succeeded pair only re-enters here to carry a
            // nomination's USE-CANDIDATE/RENOMINATION onto the wire;
            // one that hasn't been flagged for that has nothing left to
            // check.
            if pair.state() == CandidatePairState::Succeeded && !pair.use_candidate_on_next_check.load(Ordering::SeqCst) {
                continue;
            }
            if self.start_check(stream, &pair).await.is_ok() {
                self.scheduler.touch(now).await;
                self.run_nomination_and_keepalive().await;
                return;
            }
        }

        // `advance_transactions` stops at the first due pair it commits to
        // retransmitting, so at most one `Retransmit` ever appears here.
        let events = advance_transactions(&self.streams, now).await;
        let mut retransmitted = false;
        for event in events {
            if let TransactionEvent::Retransmit { stream_id, pair_id, dest, raw } = event {
                if let Some(socket) = self.socket_for_pair(stream_id, pair_id).await {
                    let _ = socket.send_to(&raw, dest).await;
                }
                retransmitted = true;
            }
        }
        if retransmitted {
            self.scheduler.touch(now).await;
            self.run_nomination_and_keepalive().await;
            return;
        }

        let mut best: Option<(Arc<Stream>, Arc<CheckPair>)> = None;
        for stream in &self.streams {
            if let Some(pair) = stream.highest_priority_waiting().await {
                let replace = best.as_ref().map_or(true, |(_, b)| pair.priority() > b.priority());
                if replace {
                    best = Some((Arc::clone(stream), pair));
                }
            }
        }
        if best.is_none() {
            let mut any_active = false;
            for s in &self.streams {
                if s.has_active_pairs().await {
                    any_active = true;
                }
            }
            if !any_active {
                for s in &self.streams {
                    s.unfreeze_all().await;
                }
                for stream in &self.streams {
                    if let Some(pair) = stream.highest_priority_waiting().await {
                        let replace = best.as_ref().map_or(true, |(_, b)| pair.priority() > b.priority());
                        if replace {
                            best = Some((Arc::clone(stream), pair));
                        }
                    }
                }
            }
        }

        if let Some((stream, pair)) = best {
            if self.start_check(&stream, &pair).await.is_ok() {
                self.scheduler.touch(now).await;
            }
        }

        self.run_nomination_and_keepalive().await;

        if self.scheduler.is_idle(now).await {
            self.run_failure_sweep().await;
        }
    }

    async fn socket_for_pair(&self, stream_id: StreamId, pair_id: PairId) -> Option<Arc<dyn Socket>> {
        let stream = self.stream(stream_id).ok()?;
        let pair = stream.pair(pair_id).await?;
        self.sockets.lock().await.get(&pair.local.id()).cloned()
    }

    async fn run_nomination_and_keepalive(&self) {
        if self.is_controlling() {
            for stream in &self.streams {
                for component_id in stream.component_ids() {
                    let elapsed = self.started_at.elapsed();
                    if let Some(pair) = self
                        .nomination
                        .evaluate_component(&self.streams, stream.id, component_id, elapsed)
                        .await
                    {
                        self.triggered.push(stream.id, pair.id).await;
                    }
                }
            }
        }

        let due = self.keepalive.due(&self.streams, Instant::now()).await;
        for item in due {
            let Some(socket) = self.sockets.lock().await.get(&item.pair.local.id()).cloned() else { continue };
            let remote = self.remote_credentials.lock().await.clone();
            let msg = if self.keepalive.conncheck() {
                match remote {
                    Some((remote_ufrag, remote_pwd)) => crate::keepalive::build_request(
                        &item.pair,
                        &self.local_ufrag,
                        &remote_ufrag,
                        &remote_pwd,
                        self.tie_breaker,
                        self.is_controlling(),
                    ),
                    None => crate::keepalive::build_indication(),
                }
            } else {
                crate::keepalive::build_indication()
            };
            if let Ok(msg) = msg {
                if let Ok(raw) = msg.marshal_binary() {
                    let _ = socket.send_to(&raw, item.pair.remote.addr()).await;
                }
            }
        }
    }

    async fn run_failure_sweep(&self) {
        for stream in &self.streams {
            for component_id in stream.component_ids() {
                let Some(component) = stream.component(component_id) else { continue };
                if component.state() == ComponentState::Failed {
                    continue;
                }
                let pairs = stream.pairs_for_component(component_id).await;
                let no_nominee = !pairs.iter().any(|p| p.nominated());
                let all_terminal = pairs
                    .iter()
                    .all(|p| matches!(p.state(), CandidatePairState::Failed));
                if (all_terminal && no_nominee) || pairs.is_empty() {
                    component.set_state(ComponentState::Failed);
                    self.fire_state_change(stream.id, component_id, ComponentState::Failed).await;
                }

                if let Some(pair_id) = component.selected_pair().await {
                    if let Some(pair) = stream.pair(pair_id).await {
                        if crate::keepalive::KeepaliveEngine::timeout_is_fatal(&pair, self.keepalive_fatal_timeout)
                            && component.state() != ComponentState::Failed
                        {
                            component.set_state(ComponentState::Failed);
                            self.fire_state_change(stream.id, component_id, ComponentState::Failed).await;
                        }
                    }
                }
            }
        }
    }

    // -- Background loop -------------------------------------------------

    /// Runs the tick loop in the background until the agent is dropped.
    /// No-op for lite agents, which never originate checks, and a no-op
    /// if already running. Grounded in the teacher's
    /// `force_candidate_contact_tx`/`contact()` wake-loop, generalized
    /// across streams.
    pub async fn run(self: Arc<Self>) {
        if self.lite {
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.force_contact_rx.lock().await.take() else {
            return;
        };

        let agent = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(agent.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        agent.tick().await;
                    }
                    got = rx.recv() => {
                        if got.is_none() {
                            return;
                        }
                        agent.tick().await;
                    }
                }
            }
        });
    }

    /// Wakes the tick loop out of its normal pacing interval -- called
    /// after any event that might make a new check runnable (a candidate
    /// added, credentials learned, a role conflict resolved).
    pub fn request_connectivity_check(&self) {
        let _ = self.force_contact_tx.try_send(());
    }

    /// Resolves the candidate id `socket` is registered under in
    /// `self.sockets`, restricted to candidates this component actually
    /// owns. Exact `Arc::ptr_eq` identity rather than `SocketKind`
    /// equality, since a component can have more than one local
    /// candidate sharing a kind (e.g. two host candidates on different
    /// interfaces).
    async fn socket_local_candidate_id(&self, component: &crate::component::Component, socket: &Arc<dyn Socket>) -> String {
        let candidate_ids: Vec<String> = {
            let sockets = self.sockets.lock().await;
            sockets
                .iter()
                .filter(|(_, s)| Arc::ptr_eq(s, socket))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in candidate_ids {
            if component.find_local_candidate(&id).await.is_some() {
                return id;
            }
        }
        String::new()
    }

    async fn socket_owning_candidate(
        &self,
        component: &crate::component::Component,
        socket: &Arc<dyn Socket>,
    ) -> Option<Arc<dyn Candidate + Send + Sync>> {
        let id = self.socket_local_candidate_id(component, socket).await;
        if id.is_empty() {
            return None;
        }
        component.find_local_candidate(&id).await
    }

    // -- Stats -------------------------------------------------------

    /// Snapshots every candidate pair across every stream/component into
    /// the RFC 8445 §11 stats shape. Counters this crate doesn't track
    /// per-pair (bitrate, consent, circuit-breaker) are left at their
    /// `Default`.
    pub async fn get_candidate_pairs_stats(&self) -> Vec<crate::stats::CandidatePairStats> {
        let mut out = Vec::new();
        for stream in &self.streams {
            for pair in stream.pairs().await {
                out.push(crate::stats::CandidatePairStats {
                    local_candidate_id: pair.local.id(),
                    remote_candidate_id: pair.remote.id(),
                    state: pair.state(),
                    nominated: pair.nominated(),
                    requests_sent: u64::from(pair.binding_request_count.load(Ordering::SeqCst)),
                    ..crate::stats::CandidatePairStats::default()
                });
            }
        }
        out
    }

    /// Snapshots every local candidate across every stream/component.
    pub async fn get_local_candidates_stats(&self) -> Vec<crate::stats::CandidateStats> {
        let mut out = Vec::new();
        for stream in &self.streams {
            for component_id in stream.component_ids() {
                let Some(component) = stream.component(component_id) else { continue };
                for c in component.local_candidates().await {
                    out.push(candidate_stats(&c));
                }
            }
        }
        out
    }

    /// Snapshots every remote candidate across every stream/component.
    pub async fn get_remote_candidates_stats(&self) -> Vec<crate::stats::CandidateStats> {
        let mut out = Vec::new();
        for stream in &self.streams {
            for component_id in stream.component_ids() {
                let Some(component) = stream.component(component_id) else { continue };
                for c in component.remote_candidates().await {
                    out.push(candidate_stats(&c));
                }
            }
        }
        out
    }
}

fn candidate_stats(c: &Arc<dyn Candidate + Send + Sync>) -> crate::stats::CandidateStats {
    crate::stats::CandidateStats {
        id: c.id(),
        network_type: c.network_type(),
        ip: c.address(),
        port: c.port(),
        candidate_type: c.candidate_type(),
        priority: c.priority(),
        relay_protocol: "udp".to_owned(),
        ..crate::stats::CandidateStats::default()
    }
}
