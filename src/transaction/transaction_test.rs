use super::*;

fn tid() -> TransactionId {
    TransactionId::new()
}

#[test]
fn test_compute_rto_floors_at_default_timeout() {
    let rto = compute_rto(Duration::from_millis(50), 1);
    assert_eq!(rto, STUN_TIMER_DEFAULT_TIMEOUT);
}

#[test]
fn test_compute_rto_scales_with_active_pairs() {
    let rto = compute_rto(Duration::from_millis(20), 50);
    assert_eq!(rto, Duration::from_millis(1000));
}

#[test]
fn test_unreliable_transaction_retransmits_then_times_out() {
    let now = Instant::now();
    let mut txn = StunTransaction::new(
        tid(),
        "127.0.0.1:1".parse().unwrap(),
        vec![0; 20],
        Duration::from_millis(100),
        2,
        false,
        Duration::from_secs(5),
        now,
    );

    assert!(!txn.is_due(now));
    let due_at = now + Duration::from_millis(100);
    assert!(txn.is_due(due_at));

    assert_eq!(txn.advance(due_at), TransactionOutcome::Retransmit);
    assert_eq!(txn.sent_count(), 2);

    let second_due = due_at + Duration::from_millis(200);
    assert_eq!(txn.advance(second_due), TransactionOutcome::Retransmit);
    assert_eq!(txn.sent_count(), 3);

    let third_due = second_due + Duration::from_millis(400);
    assert_eq!(txn.advance(third_due), TransactionOutcome::TimedOut);
}

#[test]
fn test_reliable_transaction_times_out_on_first_deadline() {
    let now = Instant::now();
    let mut txn = StunTransaction::new(
        tid(),
        "127.0.0.1:1".parse().unwrap(),
        vec![0; 20],
        Duration::from_millis(100),
        7,
        true,
        Duration::from_millis(300),
        now,
    );

    let due_at = now + Duration::from_millis(300);
    assert!(txn.is_due(due_at));
    assert_eq!(txn.advance(due_at), TransactionOutcome::TimedOut);
}
