#[cfg(test)]
mod util_test;

use std::net::{IpAddr, SocketAddr};

use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;

use crate::error::*;
use crate::network_type::NetworkType;

/// Builds the resolved socket address for a candidate. UDP and TCP share
/// the same `SocketAddr` representation in `std::net`, so this only
/// exists to keep candidate construction symmetric with the network-type
/// plumbing the rest of the crate carries around.
#[must_use]
pub fn create_addr(_network: NetworkType, ip: IpAddr, port: u16) -> SocketAddr {
    SocketAddr::new(ip, port)
}

/// Validates the USERNAME attribute on an inbound Binding request against
/// `local_ufrag:remote_ufrag`, RFC 8445 §7.3.1.2.
pub fn assert_inbound_username(m: &Message, expected_username: &str) -> Result<()> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(m)?;

    if username.to_string() != expected_username {
        return Err(Error::Other(format!(
            "{:?} expected({}) actual({})",
            Error::ErrMismatchUsername,
            expected_username,
            username,
        )));
    }

    Ok(())
}

/// Validates the MESSAGE-INTEGRITY attribute on an inbound message against
/// the short-term credential built from `key` (the local password).
pub fn assert_inbound_message_integrity(m: &mut Message, key: &[u8]) -> Result<()> {
    let message_integrity_attr = MessageIntegrity(key.to_vec());
    Ok(message_integrity_attr.check(m)?)
}
