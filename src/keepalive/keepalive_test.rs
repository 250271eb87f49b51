use super::*;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::pair::CandidatePairState;
use crate::transport::SocketKind;
use std::time::Duration;

fn host(addr: &str) -> Arc<dyn crate::candidate::Candidate + Send + Sync> {
    Arc::new(
        CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: addr.to_owned(),
                port: 4000,
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_host()
        .unwrap(),
    )
}

async fn stream_with_selected_pair() -> Arc<Stream> {
    let stream = Arc::new(Stream::new(0, &[1]));
    let pair = stream
        .get_or_create_pair(1, host("198.51.100.1"), host("198.51.100.2"), true, SocketKind::Udp)
        .await;
    pair.set_state(CandidatePairState::Succeeded);
    pair.set_valid(true);
    stream
        .component(1)
        .unwrap()
        .set_selected_pair(Some(pair.id))
        .await;
    stream.component(1).unwrap().set_state(ComponentState::Ready);
    stream
}

#[tokio::test]
async fn test_keepalive_due_fires_once_per_interval() {
    let engine = KeepaliveEngine::new(KeepaliveConfig {
        interval: Duration::from_millis(10),
        conncheck: true,
    });
    let stream = stream_with_selected_pair().await;

    let now = Instant::now();
    let due = engine.due(&[Arc::clone(&stream)], now).await;
    assert_eq!(due.len(), 1);

    let due_again = engine.due(&[Arc::clone(&stream)], now).await;
    assert!(due_again.is_empty());

    let later = now + Duration::from_millis(20);
    let due_later = engine.due(&[stream], later).await;
    assert_eq!(due_later.len(), 1);
}

#[tokio::test]
async fn test_keepalive_skips_non_ready_components() {
    let engine = KeepaliveEngine::new(KeepaliveConfig::default());
    let stream = Arc::new(Stream::new(0, &[1]));
    let pair = stream
        .get_or_create_pair(1, host("198.51.100.1"), host("198.51.100.2"), true, SocketKind::Udp)
        .await;
    pair.set_state(CandidatePairState::Succeeded);
    pair.set_valid(true);
    stream
        .component(1)
        .unwrap()
        .set_selected_pair(Some(pair.id))
        .await;

    let due = engine.due(&[stream], Instant::now()).await;
    assert!(due.is_empty());
}

#[test]
fn test_timeout_is_fatal_without_any_received_packet() {
    let stream = Stream::new(0, &[1]);
    let _ = &stream;
    let pair = CheckPair::new(0, 0, 1, host("198.51.100.1"), host("198.51.100.2"), true, SocketKind::Udp);
    assert!(KeepaliveEngine::timeout_is_fatal(&pair, Duration::from_secs(1)));

    pair.mark_received();
    assert!(!KeepaliveEngine::timeout_is_fatal(&pair, Duration::from_secs(30)));
}

#[test]
fn test_build_request_and_indication_are_well_formed_stun() {
    let pair = CheckPair::new(0, 0, 1, host("198.51.100.1"), host("198.51.100.2"), true, SocketKind::Udp);
    let msg = build_request(&pair, "ufrag", "rufrag", "pwd", 42, true).unwrap();
    assert_eq!(msg.typ, BINDING_REQUEST);

    let indication = build_indication().unwrap();
    assert_eq!(indication.typ, BINDING_INDICATION);
}

#[test]
fn test_build_request_carries_the_caller_role_not_always_controlling() {
    use crate::control::{AttrControlled, AttrControlling};
    use stun::attributes::ATTR_ICE_CONTROLLED;
    use stun::message::Getter;

    let pair = CheckPair::new(0, 0, 1, host("198.51.100.1"), host("198.51.100.2"), false, SocketKind::Udp);

    let controlling_msg = build_request(&pair, "ufrag", "rufrag", "pwd", 42, true).unwrap();
    let mut controlling_attr = AttrControlling::default();
    assert!(controlling_attr.get_from(&controlling_msg).is_ok());

    let controlled_msg = build_request(&pair, "ufrag", "rufrag", "pwd", 42, false).unwrap();
    assert!(controlled_msg.contains(ATTR_ICE_CONTROLLED));
    let mut controlled_attr = AttrControlled::default();
    assert!(controlled_attr.get_from(&controlled_msg).is_ok());
}
