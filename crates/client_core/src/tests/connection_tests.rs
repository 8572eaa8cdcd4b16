use super::*;

use std::time::Duration;

use shared::{domain::MessageId, error::ApiError};

use crate::test_support::{next_end, payload, FakeTransport};

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

fn join(channel: &str, kind: ChannelKind) -> ClientRequest {
    ClientRequest::Join {
        channel_id: ChannelId::from(channel),
        kind,
    }
}

fn leave(channel: &str, kind: ChannelKind) -> ClientRequest {
    ClientRequest::Leave {
        channel_id: ChannelId::from(channel),
        kind,
    }
}

#[tokio::test]
async fn join_ack_leave_ack_cycle() {
    let (transport, mut ends) = FakeTransport::new();
    let manager = ConnectionManager::new(transport, fast_policy(3));
    let handle = manager.connect(Credentials::new("me", "tok"));
    let mut server = next_end(&mut ends).await;
    handle.wait_until_open().await.expect("open");

    let c1 = ChannelId::from("c1");
    assert_eq!(handle.acquire(&c1, ChannelKind::Group), SessionState::Joining);
    assert_eq!(server.expect_request().await, join("c1", ChannelKind::Group));

    server.push(ServerEvent::Joined {
        channel_id: c1.clone(),
    });
    eventually!(handle.membership_state(&c1) == SessionState::Joined);

    assert_eq!(handle.release(&c1), SessionState::Leaving);
    assert_eq!(server.expect_request().await, leave("c1", ChannelKind::Group));
    server.push(ServerEvent::Left {
        channel_id: c1.clone(),
    });
    eventually!(handle.membership_state(&c1) == SessionState::Idle);
}

#[tokio::test]
async fn close_during_joining_sends_leave_after_ack() {
    let (transport, mut ends) = FakeTransport::new();
    let manager = ConnectionManager::new(transport, fast_policy(3));
    let handle = manager.connect(Credentials::new("me", "tok"));
    let mut server = next_end(&mut ends).await;
    handle.wait_until_open().await.expect("open");

    let c1 = ChannelId::from("c1");
    handle.acquire(&c1, ChannelKind::Direct);
    assert_eq!(server.expect_request().await, join("c1", ChannelKind::Direct));

    assert_eq!(handle.release(&c1), SessionState::Joining);
    assert!(server.try_request().is_none());

    server.push(ServerEvent::Joined {
        channel_id: c1.clone(),
    });
    assert_eq!(server.expect_request().await, leave("c1", ChannelKind::Direct));
}

#[tokio::test]
async fn second_holder_keeps_channel_joined() {
    let (transport, mut ends) = FakeTransport::new();
    let manager = ConnectionManager::new(transport, fast_policy(3));
    let handle = manager.connect(Credentials::new("me", "tok"));
    let mut server = next_end(&mut ends).await;
    handle.wait_until_open().await.expect("open");

    let c1 = ChannelId::from("c1");
    handle.acquire(&c1, ChannelKind::Direct);
    handle.acquire(&c1, ChannelKind::Direct);
    assert_eq!(server.expect_request().await, join("c1", ChannelKind::Direct));
    server.push(ServerEvent::Joined {
        channel_id: c1.clone(),
    });
    eventually!(handle.membership_state(&c1) == SessionState::Joined);

    assert_eq!(handle.release(&c1), SessionState::Joined);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(server.try_request().is_none());
}

#[tokio::test]
async fn reconnect_rejoins_held_channels() {
    let (transport, mut ends) = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone(), fast_policy(5));
    let handle = manager.connect(Credentials::new("me", "tok"));
    let mut first = next_end(&mut ends).await;
    handle.wait_until_open().await.expect("open");

    let c1 = ChannelId::from("c1");
    handle.acquire(&c1, ChannelKind::Group);
    assert_eq!(first.expect_request().await, join("c1", ChannelKind::Group));
    first.push(ServerEvent::Joined {
        channel_id: c1.clone(),
    });
    eventually!(handle.membership_state(&c1) == SessionState::Joined);

    let mut states = handle.watch_state();
    first.close();
    states
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .expect("reconnecting");

    let mut second = next_end(&mut ends).await;
    assert_eq!(second.expect_request().await, join("c1", ChannelKind::Group));
    assert_eq!(handle.state(), ConnectionState::Open);
    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn channel_acquired_before_open_joins_on_open() {
    let (transport, mut ends) = FakeTransport::new();
    let manager = ConnectionManager::new(transport, fast_policy(3));
    let handle = manager.connect(Credentials::new("me", "tok"));

    let c1 = ChannelId::from("c1");
    assert_eq!(handle.acquire(&c1, ChannelKind::Direct), SessionState::Idle);

    let mut server = next_end(&mut ends).await;
    assert_eq!(server.expect_request().await, join("c1", ChannelKind::Direct));
}

#[tokio::test]
async fn exhausted_reconnects_end_closed() {
    let (transport, _ends) = FakeTransport::new();
    transport.refuse_next(100);
    let manager = ConnectionManager::new(transport.clone(), fast_policy(2));
    let handle = manager.connect(Credentials::new("me", "tok"));

    assert_eq!(handle.wait_until_open().await, Err(SyncError::ConnectionClosed));
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(transport.opens(), 3);
}

#[tokio::test]
async fn one_connection_per_identity() {
    let (transport, mut ends) = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone(), fast_policy(3));

    let first = manager.connect(Credentials::new("me", "tok"));
    let _server = next_end(&mut ends).await;
    first.wait_until_open().await.expect("open");

    let again = manager.connect(Credentials::new("me", "tok"));
    assert!(Arc::ptr_eq(&first.inner, &again.inner));
    assert_eq!(transport.opens(), 1);

    let other = manager.connect(Credentials::new("you", "tok-2"));
    let server = next_end(&mut ends).await;
    assert_eq!(server.credentials.user_id, UserId::from("you"));
    assert_eq!(first.state(), ConnectionState::Closed);
    assert_eq!(other.user_id(), &UserId::from("you"));

    manager.disconnect();
    assert_eq!(other.state(), ConnectionState::Closed);
    assert!(manager.current().is_none());
}

#[tokio::test]
async fn events_are_routed_and_malformed_frames_dropped() {
    let (transport, mut ends) = FakeTransport::new();
    let manager = ConnectionManager::new(transport, fast_policy(3));
    let handle = manager.connect(Credentials::new("me", "tok"));
    let server = next_end(&mut ends).await;
    handle.wait_until_open().await.expect("open");

    let mut subscription = handle.subscribe(ChannelId::from("c1"));
    server.push_raw("{\"type\":\"message-created\"}");
    server.push(ServerEvent::Error(ApiError::new(
        shared::error::ErrorCode::Forbidden,
        "not a member",
    )));
    server.push(ServerEvent::MessageDeleted {
        channel_id: ChannelId::from("c2"),
        message_id: MessageId::from("x"),
    });
    server.push(ServerEvent::MessageCreated {
        channel_id: ChannelId::from("c1"),
        message: payload("m1", "c1", 1, "hi"),
    });

    let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("routed event");
    assert!(matches!(event, Some(ServerEvent::MessageCreated { .. })));
    assert_eq!(handle.state(), ConnectionState::Open);
}
