use std::time::Duration;

use crate::control::Role;
use crate::nomination::{AcceptanceMinWait, NominationMode};
use crate::scheduler::SchedulerConfig;

/// Wait time before nominating a host candidate.
pub(crate) const DEFAULT_HOST_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_secs(0);
/// Wait time before nominating a srflx candidate.
pub(crate) const DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_millis(500);
/// Wait time before nominating a prflx candidate.
pub(crate) const DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_millis(1000);
/// Wait time before nominating a relay candidate.
pub(crate) const DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_millis(2000);

/// Max binding request before considering a pair failed.
pub(crate) const DEFAULT_MAX_BINDING_REQUESTS: u16 = 7;

/// Default cap on non-terminal pairs kept per component, RFC 8445 §6.1.2.5's
/// "implementations SHOULD limit ... to a specific value" pair-table budget.
pub(crate) const DEFAULT_MAX_PAIRS_PER_COMPONENT: usize = 100;

/// Describes one ICE stream (an SDP m-line) to create at construction
/// time: its identifier and the component ids it carries (RTP-only media
/// has one component, RTP+RTCP has two).
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub id: usize,
    pub component_ids: Vec<u16>,
}

/// RFC 8445's compatibility knob. `Rfc8445` is the only mode this crate
/// fully implements; the legacy layouts are named so a caller's config
/// stays representable even though the engine does not special-case them,
/// per the Design Notes resolution in `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Rfc8445,
    Rfc5245,
    GoogleLegacy,
    Wlm2009,
}

impl Default for Compatibility {
    fn default() -> Self {
        Self::Rfc8445
    }
}

/// Collects the arguments to `Agent` construction into a single structure,
/// mirroring the teacher's `AgentConfig`. Candidate gathering, socket
/// binding, interface/IP filtering and mDNS are the host application's
/// responsibility (see `gathering::GatheringCollaborator`,
/// `transport::Socket`), so none of those knobs live here anymore.
pub struct AgentConfig {
    /// MUST be unguessable, at least 24 bits of output.
    pub local_ufrag: String,
    /// MUST be unguessable, at least 128 bits of output.
    pub local_pwd: String,

    pub streams: Vec<StreamConfig>,

    pub is_controlling: bool,

    /// Lite agents never originate checks and only ever answer them.
    pub lite: bool,

    pub compatibility: Compatibility,

    /// RFC 8445 §8 nomination strategy.
    pub nomination_mode: NominationMode,
    /// Whether to honor/emit the RENOMINATION extension's NOMINATION
    /// counter instead of the legacy USE-CANDIDATE flag.
    pub support_renomination: bool,

    /// The max amount of binding requests sent over a candidate pair
    /// before it is considered failed.
    pub max_binding_requests: Option<u16>,

    pub host_acceptance_min_wait: Option<Duration>,
    pub srflx_acceptance_min_wait: Option<Duration>,
    pub prflx_acceptance_min_wait: Option<Duration>,
    pub relay_acceptance_min_wait: Option<Duration>,

    /// Ta, RFC 8445 §14.
    pub check_interval: Option<Duration>,
    /// Caps the number of non-terminal pairs kept per component.
    pub max_pairs_per_component: Option<usize>,
    /// How long the scheduler can find nothing to do before running the
    /// failure-propagation sweep.
    pub idle_timeout: Option<Duration>,
    /// Tr, RFC 8445 §11: the keepalive refresh interval.
    pub keepalive_interval: Option<Duration>,
    /// Whether keepalives are credentialed Binding requests or bare
    /// indications.
    pub keepalive_conncheck: bool,

    /// Skip every local candidate that isn't a relay candidate, forcing
    /// all traffic through TURN. Host/srflx/prflx candidates are never
    /// added to a component or paired when this is set.
    pub force_relay: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            local_ufrag: String::new(),
            local_pwd: String::new(),
            streams: vec![StreamConfig {
                id: 0,
                component_ids: vec![crate::candidate::COMPONENT_RTP],
            }],
            is_controlling: false,
            lite: false,
            compatibility: Compatibility::default(),
            nomination_mode: NominationMode::default(),
            support_renomination: false,
            max_binding_requests: None,
            host_acceptance_min_wait: None,
            srflx_acceptance_min_wait: None,
            prflx_acceptance_min_wait: None,
            relay_acceptance_min_wait: None,
            check_interval: None,
            max_pairs_per_component: None,
            idle_timeout: None,
            keepalive_interval: None,
            keepalive_conncheck: true,
            force_relay: false,
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub(crate) fn max_binding_requests(&self) -> u16 {
        self.max_binding_requests.unwrap_or(DEFAULT_MAX_BINDING_REQUESTS)
    }

    #[must_use]
    pub(crate) fn acceptance_min_wait(&self) -> AcceptanceMinWait {
        AcceptanceMinWait {
            host: self.host_acceptance_min_wait.unwrap_or(DEFAULT_HOST_ACCEPTANCE_MIN_WAIT),
            server_reflexive: self
                .srflx_acceptance_min_wait
                .unwrap_or(DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT),
            peer_reflexive: self
                .prflx_acceptance_min_wait
                .unwrap_or(DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT),
            relay: self.relay_acceptance_min_wait.unwrap_or(DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT),
        }
    }

    #[must_use]
    pub(crate) fn max_pairs_per_component(&self) -> usize {
        self.max_pairs_per_component.unwrap_or(DEFAULT_MAX_PAIRS_PER_COMPONENT)
    }

    #[must_use]
    pub(crate) fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        if let Some(check_interval) = self.check_interval {
            config.timer_ta = check_interval;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.idle_timeout = idle_timeout;
        }
        config.max_conn_checks = self.max_binding_requests();
        config
    }

    #[must_use]
    pub(crate) fn role(&self) -> Role {
        if self.is_controlling {
            Role::Controlling
        } else {
            Role::Controlled
        }
    }
}
