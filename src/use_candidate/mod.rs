#[cfg(test)]
mod use_candidate_test;

use stun::attributes::{AttrType, ATTR_USE_CANDIDATE};
use stun::checks::check_size;
use stun::message::*;

/// The NOMINATION attribute used by the RENOMINATION extension
/// (draft-thatcher-ice-renomination). A 4-octet big-endian counter; a
/// value greater than any previously seen from the same remote ufrag
/// nominates a pair and supersedes the pair nominated by a lower value.
pub(crate) const ATTR_NOMINATION: AttrType = AttrType(0xC001);

const NOMINATION_SIZE: usize = 4;

#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct NominationAttr(pub u32);

impl Setter for NominationAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_NOMINATION, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for NominationAttr {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_NOMINATION)?;
        check_size(ATTR_NOMINATION, v.len(), NOMINATION_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}

impl NominationAttr {
    #[must_use]
    pub fn is_set(m: &Message) -> bool {
        m.get(ATTR_NOMINATION).is_ok()
    }
}

/// Represents USE-CANDIDATE attribute.
#[derive(Default)]
pub struct UseCandidateAttr;

impl Setter for UseCandidateAttr {
    /// Adds USE-CANDIDATE attribute to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}

impl UseCandidateAttr {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true if USE-CANDIDATE attribute is set.
    #[must_use]
    pub fn is_set(m: &Message) -> bool {
        let result = m.get(ATTR_USE_CANDIDATE);
        result.is_ok()
    }
}
