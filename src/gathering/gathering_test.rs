use super::*;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_base::CandidateBaseConfig;

#[tokio::test]
async fn test_null_gatherer_does_not_panic() {
    let gatherer = NullGatherer;
    let base = Arc::new(
        CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: "127.0.0.1".to_owned(),
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_host()
        .unwrap(),
    );

    gatherer
        .add_peer_reflexive_local(1, base.clone(), "203.0.113.9:4000".parse().unwrap(), 100)
        .await;
    gatherer
        .add_server_reflexive_or_relay(
            1,
            SocketKind::Udp,
            base,
            "203.0.113.9:4000".parse().unwrap(),
        )
        .await;
}
