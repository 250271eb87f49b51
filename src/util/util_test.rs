use stun::agent::TransactionId;
use stun::integrity::MessageIntegrity;
use stun::message::{Message, Setter, BINDING_REQUEST};
use stun::textattrs::Username;

use super::*;

#[test]
fn test_assert_inbound_username() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(Username::new(stun::attributes::ATTR_USERNAME, "alice:bob".to_owned())),
    ])?;

    assert!(assert_inbound_username(&m, "alice:bob").is_ok());
    assert!(assert_inbound_username(&m, "bob:alice").is_err());
    Ok(())
}

#[test]
fn test_assert_inbound_message_integrity() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(MessageIntegrity::new_short_term_integrity("pwd".to_owned())),
    ])?;

    assert!(assert_inbound_message_integrity(&mut m, b"pwd").is_ok());
    assert!(assert_inbound_message_integrity(&mut m, b"wrong").is_err());
    Ok(())
}
