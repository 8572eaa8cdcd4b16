use super::*;

use shared::protocol::{ClientRequest, ServerEvent};

use crate::test_support::{next_end, payload, FakeApi, FakeTransport};

fn test_config() -> SyncConfig {
    SyncConfig {
        reconnect_base_ms: 10,
        reconnect_max_ms: 40,
        reconnect_attempts: 2,
        ..SyncConfig::default()
    }
}

#[tokio::test]
async fn opening_a_channel_requires_a_connection() {
    let (transport, _ends) = FakeTransport::new();
    let client = ChatClient::new(test_config(), FakeApi::new(), transport);

    assert!(matches!(
        client.open_channel(ChannelId::from("c1"), ChannelKind::Direct),
        Err(SyncError::NotConnected)
    ));
}

#[test]
fn http_client_rejects_bad_server_url() {
    let config = SyncConfig {
        server_url: "ftp://nowhere".into(),
        ..SyncConfig::default()
    };
    assert!(matches!(
        ChatClient::with_http(config, "tok"),
        Err(SyncError::Config(_))
    ));
}

#[tokio::test]
async fn end_to_end_session_over_fakes() {
    let (transport, mut ends) = FakeTransport::new();
    let api = FakeApi::new();
    api.set_page(1, Ok(vec![payload("m1", "c1", 1, "hola")]));
    let client = ChatClient::new(test_config(), api.clone(), transport.clone());

    let connection = client.connect(Credentials::new("me", "tok"));
    let again = client.connect(Credentials::new("me", "tok"));
    let mut server = next_end(&mut ends).await;
    connection.wait_until_open().await.expect("open");
    assert_eq!(again.state(), ConnectionState::Open);
    assert_eq!(transport.opens(), 1);

    let session = client
        .open_channel(ChannelId::from("c1"), ChannelKind::Direct)
        .expect("session");
    assert!(matches!(
        server.expect_request().await,
        ClientRequest::Join { .. }
    ));
    eventually!(session.confirmed().await.len() == 1);

    server.push(ServerEvent::MessageCreated {
        channel_id: ChannelId::from("c1"),
        message: payload("m2", "c1", 2, "que tal"),
    });
    eventually!(session.confirmed().await.len() == 2);
    eventually!(client.directory().cached(&"u2".into()).is_some());

    client.disconnect();
    assert!(client.connection().is_none());
    assert_eq!(session.connection_state(), ConnectionState::Closed);
}
