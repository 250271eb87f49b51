use std::time::Duration;

use super::*;

use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::{Candidate, COMPONENT_RTP};
use crate::transport::SocketKind;

fn host(address: &str, priority: u32) -> Arc<dyn Candidate + Send + Sync> {
    Arc::new(
        CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: address.to_owned(),
                component: COMPONENT_RTP,
                priority,
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_host()
        .unwrap(),
    )
}

#[tokio::test]
async fn test_regular_mode_picks_highest_priority_valid_pair_once() {
    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP]));
    let streams = [stream.clone()];
    let low = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.1", 1), host("10.0.0.9", 1), true, SocketKind::Udp)
        .await;
    let high = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.2", 1000), host("10.0.0.9", 1000), true, SocketKind::Udp)
        .await;
    low.set_state(CandidatePairState::Succeeded);
    high.set_state(CandidatePairState::Succeeded);

    let controller = NominationController::new(NominationMode::Regular, AcceptanceMinWait::default(), false);
    let picked = controller
        .evaluate_component(&streams, stream.id, COMPONENT_RTP, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(picked.id, high.id);
    assert!(high.use_candidate_on_next_check.load(std::sync::atomic::Ordering::SeqCst));

    high.set_nominated(true);
    let again = controller
        .evaluate_component(&streams, stream.id, COMPONENT_RTP, Duration::from_secs(1))
        .await;
    assert!(again.is_none());
}

#[tokio::test]
async fn test_acceptance_min_wait_blocks_early_nomination() {
    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP]));
    let streams = [stream.clone()];
    let pair = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.1", 100), host("10.0.0.9", 100), true, SocketKind::Udp)
        .await;
    pair.set_state(CandidatePairState::Succeeded);

    let wait = AcceptanceMinWait {
        host: Duration::from_secs(5),
        ..AcceptanceMinWait::default()
    };
    let controller = NominationController::new(NominationMode::Regular, wait, false);

    let too_soon = controller
        .evaluate_component(&streams, stream.id, COMPONENT_RTP, Duration::from_millis(10))
        .await;
    assert!(too_soon.is_none());

    let later = controller
        .evaluate_component(&streams, stream.id, COMPONENT_RTP, Duration::from_secs(6))
        .await;
    assert!(later.is_some());
}

#[tokio::test]
async fn test_aggressive_mode_can_move_nomination_to_better_pair() {
    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP]));
    let streams = [stream.clone()];
    let first = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.1", 10), host("10.0.0.9", 10), true, SocketKind::Udp)
        .await;
    first.set_state(CandidatePairState::Succeeded);

    let controller = NominationController::new(NominationMode::Aggressive, AcceptanceMinWait::default(), true);
    let picked = controller
        .evaluate_component(&streams, stream.id, COMPONENT_RTP, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(picked.id, first.id);
    first.set_nominated(true);

    let better = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.2", 1000), host("10.0.0.9", 1000), true, SocketKind::Udp)
        .await;
    better.set_state(CandidatePairState::Succeeded);

    let picked_again = controller
        .evaluate_component(&streams, stream.id, COMPONENT_RTP, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(picked_again.id, better.id);
}

#[tokio::test]
async fn test_regular_mode_prefers_endpoint_already_nominated_on_another_component() {
    use crate::candidate::COMPONENT_RTCP;

    let stream = Arc::new(Stream::new(0, &[COMPONENT_RTP, COMPONENT_RTCP]));
    let streams = [stream.clone()];

    // RTCP already nominated a pair reaching 10.0.0.9.
    let rtcp_pair = stream
        .get_or_create_pair(COMPONENT_RTCP, host("10.0.0.1", 1), host("10.0.0.9", 1), true, SocketKind::Udp)
        .await;
    rtcp_pair.set_state(CandidatePairState::Succeeded);
    rtcp_pair.set_nominated(true);

    // RTP has two valid pairs: a higher-priority one to a different
    // endpoint, and a lower-priority one matching RTCP's endpoint.
    let other_endpoint = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.2", 1000), host("10.0.0.50", 1000), true, SocketKind::Udp)
        .await;
    other_endpoint.set_state(CandidatePairState::Succeeded);
    let matching_endpoint = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.3", 10), host("10.0.0.9", 10), true, SocketKind::Udp)
        .await;
    matching_endpoint.set_state(CandidatePairState::Succeeded);

    // A still-frozen pair keeps this component "evolving" so rule 5's
    // fallback (ignore cross-component preference once nothing further
    // can happen) doesn't pre-empt rule 3 here.
    let _still_frozen = stream
        .get_or_create_pair(COMPONENT_RTP, host("10.0.0.4", 1), host("10.0.0.60", 1), true, SocketKind::Udp)
        .await;

    let controller = NominationController::new(NominationMode::Regular, AcceptanceMinWait::default(), false);
    let picked = controller
        .evaluate_component(&streams, stream.id, COMPONENT_RTP, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(picked.id, matching_endpoint.id, "rule 3 should prefer RTCP's already-nominated endpoint over raw priority");
}

#[test]
fn test_renomination_counter_only_moves_forward() {
    let stream_pairs_setup = || {
        let pair = Arc::new(CheckPair::new(
            0,
            0,
            COMPONENT_RTP,
            host("10.0.0.1", 1),
            host("10.0.0.9", 1),
            true,
            SocketKind::Udp,
        ));
        pair
    };
    let pair = stream_pairs_setup();

    assert!(NominationController::accept_renomination(&pair, 1));
    NominationController::record_renomination(&pair, 1);
    assert!(pair.nominated());

    assert!(!NominationController::accept_renomination(&pair, 1));
    assert!(NominationController::accept_renomination(&pair, 2));
}

#[test]
fn test_renomination_selected_picks_highest_counter() {
    let a = Arc::new(CheckPair::new(
        0,
        0,
        COMPONENT_RTP,
        host("10.0.0.1", 1),
        host("10.0.0.9", 1),
        true,
        SocketKind::Udp,
    ));
    let b = Arc::new(CheckPair::new(
        1,
        0,
        COMPONENT_RTP,
        host("10.0.0.2", 1),
        host("10.0.0.8", 1),
        true,
        SocketKind::Udp,
    ));

    NominationController::record_renomination(&a, 3);
    NominationController::record_renomination(&b, 5);

    let selected = NominationController::renomination_selected(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(selected.id, b.id);
}
