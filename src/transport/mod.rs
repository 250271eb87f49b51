
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::candidate::{Candidate, CandidateType};
use crate::error::Result;
use crate::tcp_type::TcpType;

/// The wire transport a candidate is reachable over. Candidate pairs may
/// only be formed between `SocketKind`s the compatibility matrix allows
/// (see `is_compatible_with`); the engine consults this rather than
/// `NetworkType` alone because several of these kinds share `is_tcp()`
/// but are not interchangeable (an HTTP-tunnelled socket cannot answer a
/// bare TCP-active check).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Udp,
    TcpBsd,
    TcpActive,
    TcpPassive,
    TcpSo,
    PseudoSsl,
    Http,
    Socks5,
    UdpTurn,
    UdpTurnOverTcp,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Udp => "udp",
            Self::TcpBsd => "tcp-bsd",
            Self::TcpActive => "tcp-active",
            Self::TcpPassive => "tcp-passive",
            Self::TcpSo => "tcp-so",
            Self::PseudoSsl => "pseudo-ssl",
            Self::Http => "http",
            Self::Socks5 => "socks5",
            Self::UdpTurn => "udp-turn",
            Self::UdpTurnOverTcp => "udp-turn-over-tcp",
        };
        write!(f, "{s}")
    }
}

impl SocketKind {
    /// Reliable, connection-oriented transports use the fixed
    /// `stun_reliable_timeout` for their single retransmission instead
    /// of the exponential-backoff RTO unreliable transports use.
    #[must_use]
    pub const fn reliable(self) -> bool {
        !matches!(self, Self::Udp | Self::UdpTurn | Self::UdpTurnOverTcp)
    }

    /// RFC 8445 §6.1.2.2's "candidates with different transport
    /// protocols MUST NOT be paired" rule, generalized across the
    /// socket-kind taxonomy a host application's gathering collaborator
    /// can produce. UDP relayed-over-TCP is compatible with itself and
    /// with plain UDP (it presents a UDP-shaped relay to the peer);
    /// every other kind is only compatible with itself.
    #[must_use]
    pub const fn is_compatible_with(self, other: Self) -> bool {
        match (self, other) {
            (Self::Udp, Self::Udp)
            | (Self::Udp, Self::UdpTurn)
            | (Self::UdpTurn, Self::Udp)
            | (Self::Udp, Self::UdpTurnOverTcp)
            | (Self::UdpTurnOverTcp, Self::Udp)
            | (Self::UdpTurn, Self::UdpTurn)
            | (Self::UdpTurnOverTcp, Self::UdpTurnOverTcp)
            | (Self::UdpTurn, Self::UdpTurnOverTcp)
            | (Self::UdpTurnOverTcp, Self::UdpTurn) => true,
            (a, b) if a as u8 == b as u8 => true,
            _ => false,
        }
    }
}

/// Derives the `SocketKind` a candidate is reachable over from its
/// network type and (for TCP) its `TcpType`, so pairing code never has
/// to ask the gathering collaborator for a kind it can already read off
/// the candidate. A UDP relay candidate is tagged `UdpTurn` rather than
/// plain `Udp`: it still presents a UDP-shaped path to the peer, but the
/// compatibility matrix in `SocketKind::is_compatible_with` treats it as
/// a distinct kind so relay-vs-relay pairing decisions stay explicit.
#[must_use]
pub fn socket_kind_for(c: &(dyn Candidate + Send + Sync)) -> SocketKind {
    if c.network_type().is_tcp() {
        return match c.tcp_type() {
            TcpType::Active => SocketKind::TcpActive,
            TcpType::Passive => SocketKind::TcpPassive,
            TcpType::SimultaneousOpen => SocketKind::TcpSo,
            TcpType::Unspecified => SocketKind::TcpBsd,
        };
    }
    if c.candidate_type() == CandidateType::Relay {
        return SocketKind::UdpTurn;
    }
    SocketKind::Udp
}

/// A send/receive endpoint the host application supplies for a
/// candidate. This crate never opens sockets itself (candidate
/// gathering and socket I/O are the host's responsibility, per
/// `gathering::GatheringCollaborator`); it only ever sends and receives
/// raw STUN datagrams through this trait.
#[async_trait]
pub trait Socket: Send + Sync {
    fn kind(&self) -> SocketKind;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;

    async fn close(&self) -> Result<()>;
}

/// Adapts the teacher's existing `util::Conn` (the trait its UDP/TCP
/// backends already implement) to `Socket`, so those backends remain
/// pluggable without this crate re-implementing socket I/O.
pub struct UtilConnSocket {
    conn: Arc<dyn util::Conn + Send + Sync>,
    kind: SocketKind,
}

impl UtilConnSocket {
    #[must_use]
    pub fn new(conn: Arc<dyn util::Conn + Send + Sync>, kind: SocketKind) -> Self {
        Self { conn, kind }
    }
}

#[async_trait]
impl Socket for UtilConnSocket {
    fn kind(&self) -> SocketKind {
        self.kind
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.conn.send_to(buf, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.conn.recv_from(buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.conn.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.conn.close().await?)
    }
}
