use std::time::{Duration, Instant};

use super::*;

use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::Candidate;
use crate::candidate::COMPONENT_RTP;
use crate::transport::SocketKind;

fn host(address: &str) -> Arc<dyn Candidate + Send + Sync> {
    Arc::new(
        CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: address.to_owned(),
                component: COMPONENT_RTP,
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_host()
        .unwrap(),
    )
}

#[tokio::test]
async fn test_triggered_queue_takes_priority() {
    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP]));
    let low = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.1"), host("10.0.0.9"), true, SocketKind::Udp)
        .await;
    let high = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.2"), host("10.0.0.8"), true, SocketKind::Udp)
        .await;

    let triggered = TriggeredQueue::new();
    triggered.push(stream.id, low.id).await;

    let scheduler = Scheduler::new(SchedulerConfig::default(), Instant::now());
    let streams = vec![Arc::clone(&stream)];
    let picked = scheduler.next_pair(&streams, &triggered).await.unwrap();

    assert_eq!(picked.id, low.id);
    assert_ne!(picked.id, high.id);
}

#[tokio::test]
async fn test_next_pair_falls_back_to_highest_priority_waiting() {
    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP]));
    stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.1"), host("10.0.0.9"), true, SocketKind::Udp)
        .await;
    let high = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.2"), host("10.0.0.8"), true, SocketKind::Udp)
        .await;

    let triggered = TriggeredQueue::new();
    let scheduler = Scheduler::new(SchedulerConfig::default(), Instant::now());
    let streams = vec![stream];
    let picked = scheduler.next_pair(&streams, &triggered).await.unwrap();

    assert_eq!(picked.id, high.id);
}

#[tokio::test]
async fn test_advance_transactions_times_out_non_retransmittable_pair() {
    use crate::transaction::StunTransaction;
    use stun::agent::TransactionId;

    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP]));
    let pair = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.1"), host("10.0.0.9"), true, SocketKind::Udp)
        .await;
    pair.set_state(CandidatePairState::InProgress);
    pair.set_retransmit(false);

    let now = Instant::now();
    let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let txn = StunTransaction::new(
        TransactionId::new(),
        dest,
        vec![1, 2, 3],
        Duration::from_millis(1),
        7,
        false,
        Duration::from_secs(1),
        now,
    );
    *pair.transaction.lock().unwrap() = Some(txn);

    let later = now + Duration::from_millis(5);
    let events = advance_transactions(&[stream], later).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], TransactionEvent::TimedOut { .. }));
    assert_eq!(pair.state(), CandidatePairState::Failed);
}

#[tokio::test]
async fn test_advance_transactions_retransmits_then_fails_after_max() {
    use crate::transaction::StunTransaction;
    use stun::agent::TransactionId;

    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP]));
    let pair = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.1"), host("10.0.0.9"), true, SocketKind::Udp)
        .await;
    pair.set_state(CandidatePairState::InProgress);

    let mut now = Instant::now();
    let mut rto = Duration::from_millis(1);
    let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let txn = StunTransaction::new(TransactionId::new(), dest, vec![1, 2, 3], rto, 7, false, Duration::from_secs(1), now);
    *pair.transaction.lock().unwrap() = Some(txn);

    // The default max of 7 retransmissions, each with a doubling backoff
    // and no response, must leave the pair InProgress every time.
    for _ in 0..7 {
        now += rto;
        let events = advance_transactions(std::slice::from_ref(&stream), now).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransactionEvent::Retransmit { .. }), "each of the first 7 timeouts should retransmit");
        assert_eq!(pair.state(), CandidatePairState::InProgress);
        rto *= 2;
    }

    // The 8th timeout exhausts max_retransmissions and fails the pair.
    now += rto;
    let events = advance_transactions(&[stream], now).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], TransactionEvent::TimedOut { .. }));
    assert_eq!(pair.state(), CandidatePairState::Failed);
}
