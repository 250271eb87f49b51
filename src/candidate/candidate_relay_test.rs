use super::*;
use crate::candidate::candidate_relay::CandidateRelayConfig;

#[tokio::test]
async fn test_relay_candidate_priority_is_lowest() -> Result<()> {
    let relay = CandidateRelayConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "198.51.100.7".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        rel_addr: "192.168.0.2".to_owned(),
        rel_port: 54321,
    }
    .new_candidate_relay()?;

    let host = crate::candidate::candidate_host::CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "192.168.0.2".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        tcp_type: TcpType::Unspecified,
    }
    .new_candidate_host()?;

    assert!(host.priority() > relay.priority());
    assert_eq!(relay.candidate_type(), CandidateType::Relay);
    assert_eq!(relay.base_address(), "192.168.0.2");

    Ok(())
}
