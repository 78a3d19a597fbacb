/// Shared push channel lifecycle and routing
mod common;

use common::*;
use feedsync_core::push::{ChannelManager, ChannelStatus, FeedItem, PushEvent};
use feedsync_core::types::FeedKind;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_event(rx: &mut broadcast::Receiver<PushEvent>) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .expect("channel closed")
}

#[tokio::test]
async fn test_one_connection_for_both_feeds() {
    let config = test_config("u1");
    let (connector, mut servers) = DuplexConnector::new();
    let connects = connector.connects.clone();
    let manager = ChannelManager::new(connector, &config);

    let chat = manager.open("u1").unwrap();
    let notifications = manager.open("u1").unwrap();
    assert_eq!(manager.subscriber_count(), 2);

    let _server = FakeServer::accept_joined(&mut servers, "u1").await;
    let mut status = manager.status();
    status.wait_for(|s| s.is_connected()).await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    drop(chat);
    assert_eq!(manager.subscriber_count(), 1);
    assert!(manager.status().borrow().is_connected());

    let extra = notifications.clone();
    assert_eq!(manager.subscriber_count(), 2);
    drop(notifications);
    drop(extra);
    assert_eq!(manager.subscriber_count(), 0);
    assert_eq!(*manager.status().borrow(), ChannelStatus::Closed);
}

#[tokio::test]
async fn test_identity_is_required_and_exclusive() {
    let config = test_config("u1");
    let (connector, _servers) = DuplexConnector::new();
    let manager = ChannelManager::new(connector, &config);

    assert!(manager.open("").unwrap_err().is_auth());
    let handle = manager.open("u1").unwrap();
    assert!(format!("{:?}", handle).contains("\"u1\""));
    assert!(manager.open("u2").unwrap_err().is_auth());
    assert_eq!(manager.subscriber_count(), 1);
}

#[tokio::test]
async fn test_events_are_routed_by_kind() {
    let config = test_config("u1");
    let (connector, mut servers) = DuplexConnector::new();
    let manager = ChannelManager::new(connector, &config);
    let handle = manager.open("u1").unwrap();
    let mut chat = handle.subscribe(FeedKind::Chat);
    let mut notifications = handle.subscribe(FeedKind::Notifications);
    let mut server = FakeServer::accept_joined(&mut servers, "u1").await;

    server.push("typing", json!({ "success": true })).await;
    server.push_raw("{not json\n").await;
    server
        .push(
            "receive_message",
            json!({ "success": true, "data": {
                "_id": "m7", "senderId": { "_id": "u2", "name": "Bo" }, "receiverId": "u1",
                "text": "yo", "createdAt": "2024-06-01T09:00:00Z"
            }}),
        )
        .await;
    server
        .push("unread_count_update", json!({ "success": true, "data": { "count": 4 } }))
        .await;

    match next_event(&mut chat).await {
        PushEvent::ItemReceived(FeedItem::Message(m)) => {
            assert_eq!(m.id, "m7");
            assert_eq!(m.conversation_id, "u1_u2");
            assert_eq!(m.body, "yo");
        }
        other => panic!("unexpected chat event {:?}", other),
    }
    assert_eq!(next_event(&mut notifications).await, PushEvent::CounterUpdated(4));
    assert!(chat.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_degrades_then_reconnects() {
    let config = test_config("u1");
    let (connector, mut servers) = DuplexConnector::new();
    let manager = ChannelManager::new(connector, &config);
    let handle = manager.open("u1").unwrap();
    let mut status = handle.status();

    let server = FakeServer::accept_joined(&mut servers, "u1").await;
    status
        .wait_for(|s| *s == ChannelStatus::Connected { session: 1 })
        .await
        .unwrap();

    drop(server);
    status
        .wait_for(|s| *s == ChannelStatus::Disconnected)
        .await
        .unwrap();

    let _server = FakeServer::accept_joined(&mut servers, "u1").await;
    status
        .wait_for(|s| *s == ChannelStatus::Connected { session: 2 })
        .await
        .unwrap();
    assert_eq!(manager.subscriber_count(), 1);
}

#[tokio::test]
async fn test_close_invalidates_outstanding_handles() {
    let config = test_config("u1");
    let (connector, mut servers) = DuplexConnector::new();
    let manager = ChannelManager::new(connector, &config);
    let stale = manager.open("u1").unwrap();
    let _server = FakeServer::accept_joined(&mut servers, "u1").await;

    manager.close();
    assert_eq!(*manager.status().borrow(), ChannelStatus::Closed);
    let err = stale
        .emit(feedsync_core::push::Frame::join("u1"))
        .await
        .unwrap_err();
    assert!(err.is_transport());

    // A fresh session may now bind a different identity
    let fresh = manager.open("u2").unwrap();
    assert_eq!(fresh.identity(), "u2");
    drop(stale);
    assert_eq!(manager.subscriber_count(), 1);
}
