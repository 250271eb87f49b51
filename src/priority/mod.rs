#[cfg(test)]
mod priority_test;

use stun::attributes::{AttrType, ATTR_PRIORITY};
use stun::checks::check_size;
use stun::message::*;

const PRIORITY_SIZE: usize = 4; // 32 bit unsigned integer

/// Represents the PRIORITY attribute (RFC 8445 §7.1.1), the 32-bit value a
/// candidate pair's local candidate would carry if the local peer-reflexive
/// candidate it implies were ever discovered from this check.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct PriorityAttr(pub u32);

impl Setter for PriorityAttr {
    /// Adds PRIORITY to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; PRIORITY_SIZE];
        v.copy_from_slice(&self.0.to_be_bytes());
        m.add(ATTR_PRIORITY, &v);
        Ok(())
    }
}

impl Getter for PriorityAttr {
    /// Decodes PRIORITY from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_PRIORITY)?;
        check_size(ATTR_PRIORITY, v.len(), PRIORITY_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}

#[allow(dead_code)]
const _ATTR_PRIORITY_TYPE: AttrType = ATTR_PRIORITY;

/// RFC 8445 §4.1.3 / §7.1.1: the PRIORITY attribute a check carries is
/// not the sending candidate's own priority, but the priority a
/// peer-reflexive candidate learned from this check would have --
/// same local preference and component, but the peer-reflexive type
/// preference (110) in place of whatever the local candidate's own
/// type preference is. Computed by replacing the top byte of the
/// local candidate's priority (which RFC 8445 §5.1.2 assigns to the
/// type preference) rather than recomputing from scratch, so it stays
/// correct even for candidate kinds with unusual local-preference
/// rules.
#[must_use]
pub fn stun_request_priority(local_priority: u32, peer_reflexive_preference: u16) -> u32 {
    (local_priority & 0x00FF_FFFF) | (u32::from(peer_reflexive_preference) << 24)
}
