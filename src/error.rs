use std::num::ParseIntError;
use std::time::SystemTimeError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates local username fragment insufficient bits are provided.
    /// Have to be at least 24 bits long.
    #[error("local username fragment is less than 24 bits long")]
    ErrLocalUfragInsufficientBits,

    /// Indicates local passoword insufficient bits are provided.
    /// Have to be at least 128 bits long.
    #[error("local password is less than 128 bits long")]
    ErrLocalPwdInsufficientBits,

    /// Indicates the agent is closed.
    #[error("the agent is closed")]
    ErrClosed,

    /// Indicates agent was started with an empty remote ufrag.
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,

    /// Indicates agent was started with an empty remote pwd.
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,

    /// Indicates we were unable to parse a candidate address.
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("could not parse type")]
    ErrParseType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("unable to determine networkType")]
    ErrDetermineNetworkType,
    #[error("username mismatch")]
    ErrMismatchUsername,

    /// Indicates a stream or component identifier used in an operation does not exist.
    #[error("unknown stream or component")]
    ErrUnknownStreamOrComponent,

    /// Indicates a candidate pair lookup by id failed.
    #[error("unknown candidate pair")]
    ErrUnknownCandidatePair,

    /// Indicates a socket was handed to the agent whose `SocketKind` does not
    /// match what the pair compatibility matrix allows for the candidates it connects.
    #[error("socket kind incompatible with candidate pair")]
    ErrIncompatibleSocketKind,

    /// Indicates `compatibility` names a mode this crate does not implement.
    #[error("unsupported ICE compatibility mode")]
    ErrUnsupportedCompatibility,

    /// Indicates a NOMINATION attribute carried a counter not greater than the
    /// last one accepted from this remote ufrag.
    #[error("stale renomination counter")]
    ErrStaleRenomination,

    /// Returned to the dispatcher when an inbound binding request should be
    /// answered with 420 (Unknown Attribute).
    #[error("unknown mandatory attribute: {0}")]
    ErrUnknownMandatoryAttribute(u16),

    /// Returned to the dispatcher when an inbound binding request fails
    /// short-term-credential validation and should be answered with 401.
    #[error("unauthorized")]
    ErrUnauthorized,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}
