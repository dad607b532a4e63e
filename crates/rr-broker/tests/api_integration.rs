//! API integration tests
//!
//! Tests the JSON-lines API server against a live broker.

mod common;

use rr_broker::identity::hash_token;
use rr_broker::store::NewAgent;
use rr_core::api::{ApiRequest, ApiResponse};
use rr_core::config::BrokerConfig;
use rr_core::{AgentId, UserId};

use common::TestBroker;

#[tokio::test]
async fn test_api_ping_pong() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut client = broker.client().await;

    let response = client.send_request(ApiRequest::Ping).await;
    assert!(matches!(response, ApiResponse::Pong));
}

#[tokio::test]
async fn test_api_status() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut client = broker.client().await;

    match client.send_request(ApiRequest::GetStatus).await {
        ApiResponse::Status(status) => {
            assert!(status.running);
            assert_eq!(status.connected_agents, 0);
            assert_eq!(status.pending_requests, 0);
            assert!(!status.version.is_empty());
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_api_key_required() {
    let config = BrokerConfig {
        api_key: Some("s3cret".to_string()),
        ..Default::default()
    };
    let broker = TestBroker::start(config).await;
    let mut client = broker.client().await;

    // Ping is always allowed
    assert!(matches!(
        client.send_request(ApiRequest::Ping).await,
        ApiResponse::Pong
    ));

    let list = ApiRequest::ListDevices {
        user_id: UserId::new(1),
    };
    assert!(matches!(
        client.send_request(list.clone()).await,
        ApiResponse::Error { .. }
    ));

    let wrong = ApiRequest::Authenticate {
        api_key: "guess".to_string(),
    };
    assert!(matches!(
        client.send_request(wrong).await,
        ApiResponse::Error { .. }
    ));
    assert!(matches!(
        client.send_request(list.clone()).await,
        ApiResponse::Error { .. }
    ));

    let right = ApiRequest::Authenticate {
        api_key: "s3cret".to_string(),
    };
    assert!(matches!(client.send_request(right).await, ApiResponse::Ok));
    assert!(matches!(
        client.send_request(list).await,
        ApiResponse::Devices { .. }
    ));
}

#[tokio::test]
async fn test_invalid_json_gets_error_and_connection_survives() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut client = broker.client().await;

    let response = client
        .send_request(ApiRequest::GetSelectedDevice {
            user_id: UserId::new(1),
        })
        .await;
    assert!(matches!(response, ApiResponse::SelectedDevice { device: None }));

    let raw = tokio::net::TcpStream::connect(broker.api_addr).await.unwrap();
    let (reader, mut writer) = raw.into_split();
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    writer.write_all(b"{not json}\n{\"type\":\"ping\"}\n").await.unwrap();
    let mut lines = tokio::io::BufReader::new(reader).lines();

    let first: ApiResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(first, ApiResponse::Error { .. }));
    let second: ApiResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(second, ApiResponse::Pong));
}

#[tokio::test]
async fn test_pairing_cap_enforced() {
    let config = BrokerConfig {
        max_agents_per_user: 2,
        ..Default::default()
    };
    let broker = TestBroker::start(config).await;
    let mut client = broker.client().await;
    let user = UserId::new(3);

    for i in 0..2 {
        broker
            .state
            .store
            .insert_agent(
                &NewAgent {
                    agent_id: format!("agent-{}", i),
                    token_hash: hash_token(&format!("token-{}", i)),
                    machine_name: format!("PC-{}", i),
                    friendly_name: None,
                },
                user,
            )
            .await
            .unwrap();
    }

    match client
        .send_request(ApiRequest::GeneratePairingCode { user_id: user })
        .await
    {
        ApiResponse::Error { message } => assert!(message.contains("limit")),
        other => panic!("unexpected response: {:?}", other),
    }

    match client
        .send_request(ApiRequest::GeneratePairingCode {
            user_id: UserId::new(4),
        })
        .await
    {
        ApiResponse::PairingCode(info) => {
            assert_eq!(info.code.len(), 6);
            assert!(info.expires_at > rr_core::time::unix_timestamp());
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_rename_device() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut client = broker.client().await;
    let user = UserId::new(1);

    broker
        .state
        .store
        .insert_agent(
            &NewAgent {
                agent_id: "agent-1".to_string(),
                token_hash: hash_token("token-1"),
                machine_name: "DESKTOP-7QK".to_string(),
                friendly_name: None,
            },
            user,
        )
        .await
        .unwrap();

    let rename = ApiRequest::RenameDevice {
        user_id: user,
        agent_id: AgentId::new("agent-1"),
        friendly_name: Some("Home".to_string()),
    };
    assert!(matches!(client.send_request(rename).await, ApiResponse::Ok));

    let foreign = ApiRequest::RenameDevice {
        user_id: UserId::new(2),
        agent_id: AgentId::new("agent-1"),
        friendly_name: Some("Mine".to_string()),
    };
    match client.send_request(foreign).await {
        ApiResponse::Error { message } => assert_eq!(message, "Device belongs to another user"),
        other => panic!("unexpected response: {:?}", other),
    }

    match client
        .send_request(ApiRequest::ListDevices { user_id: user })
        .await
    {
        ApiResponse::Devices { devices } => {
            assert_eq!(devices[0].friendly_name.as_deref(), Some("Home"));
        }
        other => panic!("unexpected response: {:?}", other),
    }
}
