#[cfg(test)]
mod gathering_test;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::candidate::Candidate;
use crate::transport::SocketKind;

/// The host application's candidate gatherer. This engine never
/// performs STUN/TURN gathering, mDNS resolution, or interface
/// enumeration itself (out of scope, per the crate's "external
/// collaborators" boundary) — instead it calls back into this trait at
/// the two points RFC 8445 requires new local candidates to appear
/// mid-session: when a peer-reflexive candidate is learned from an
/// inbound check, and when an outbound check's response reveals a
/// server-reflexive or relayed mapping the agent did not already know
/// about.
#[async_trait]
pub trait GatheringCollaborator: Send + Sync {
    /// Called when the dispatcher observes a source address on an
    /// inbound binding request that does not match any known remote
    /// candidate. The default RFC 8445 behavior (synthesizing a
    /// peer-reflexive candidate locally) happens regardless of this
    /// callback; the callback exists so the host can also surface the
    /// candidate to its signaling layer.
    async fn add_peer_reflexive_local(
        &self,
        component_id: u16,
        base: Arc<dyn Candidate + Send + Sync>,
        mapped: SocketAddr,
        priority: u32,
    );

    /// Called when an outbound check's success response carries an
    /// XOR-MAPPED-ADDRESS that differs from every local candidate
    /// already gathered for this socket, which RFC 8445 §7.2.5.3.1
    /// treats as evidence of a server-reflexive or relayed mapping the
    /// host's gathering pass did not enumerate (typically because the
    /// check itself traversed a NAT the gathering pass didn't probe).
    async fn add_server_reflexive_or_relay(
        &self,
        component_id: u16,
        socket_kind: SocketKind,
        base: Arc<dyn Candidate + Send + Sync>,
        mapped: SocketAddr,
    );
}

/// A `GatheringCollaborator` that only logs. Used as the default so the
/// engine is usable standalone (e.g. in tests that wire up candidates by
/// hand) without a host application plugged in.
#[derive(Default)]
pub struct NullGatherer;

#[async_trait]
impl GatheringCollaborator for NullGatherer {
    async fn add_peer_reflexive_local(
        &self,
        component_id: u16,
        _base: Arc<dyn Candidate + Send + Sync>,
        mapped: SocketAddr,
        priority: u32,
    ) {
        log::debug!(
            "NullGatherer: peer-reflexive local candidate {mapped} (component {component_id}, priority {priority}) discovered but not surfaced"
        );
    }

    async fn add_server_reflexive_or_relay(
        &self,
        component_id: u16,
        socket_kind: SocketKind,
        _base: Arc<dyn Candidate + Send + Sync>,
        mapped: SocketAddr,
    ) {
        log::debug!(
            "NullGatherer: {socket_kind} mapping {mapped} (component {component_id}) discovered but not surfaced"
        );
    }
}
