use super::*;
use crate::candidate::candidate_server_reflexive::CandidateServerReflexiveConfig;

#[tokio::test]
async fn test_server_reflexive_candidate_base_address() -> Result<()> {
    let c = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "203.0.113.5".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        rel_addr: "192.168.0.2".to_owned(),
        rel_port: 54321,
    }
    .new_candidate_server_reflexive()?;

    assert_eq!(c.candidate_type(), CandidateType::ServerReflexive);
    assert_eq!(c.address(), "203.0.113.5");
    assert_eq!(c.base_address(), "192.168.0.2");
    assert_eq!(
        c.related_address(),
        Some(CandidateRelatedAddress {
            address: "192.168.0.2".to_owned(),
            port: 54321,
        })
    );

    Ok(())
}

#[tokio::test]
async fn test_server_reflexive_foundation_shared_with_host_on_same_base() -> Result<()> {
    let srflx = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "203.0.113.5".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        rel_addr: "192.168.0.2".to_owned(),
        rel_port: 54321,
    }
    .new_candidate_server_reflexive()?;

    let other_server_same_base = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "203.0.113.6".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        rel_addr: "192.168.0.2".to_owned(),
        rel_port: 54321,
    }
    .new_candidate_server_reflexive()?;

    // Same base, same type, same network: same foundation even though the
    // server-visible mapped address differs.
    assert_eq!(srflx.foundation(), other_server_same_base.foundation());

    Ok(())
}
