mod common;

use chrono::{Duration as ChronoDuration, Utc};
use messaging_hub::error::HubError;
use messaging_hub::infra::PendingStore;
use messaging_hub::model::{ChatMessage, DomainEvent, Notification, TypingEvent};
use messaging_hub::Session;
use serde_json::json;

use common::{assert_silent, next_json, start_hub, StubDirectory};

#[tokio::test]
async fn test_register_twice_does_not_duplicate_group_fan_out() {
    let hub = start_hub(StubDirectory::default().with_group("g1", &["bob", "carol"]));
    let (bob, mut bob_rx) = Session::new("bob", ["g1"], 8);

    hub.handle.register(bob.clone()).await.unwrap();
    hub.handle.register(bob.clone()).await.unwrap();

    let snapshot = hub.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.group_sessions("g1"), 1);
    assert_eq!(snapshot.stats.connections, 1);

    hub.handle
        .broadcast(ChatMessage::group("carol", "g1", "hello"))
        .await
        .unwrap();
    assert_eq!(next_json(&mut bob_rx).await["content"], "hello");
    assert_silent(&mut bob_rx).await;
}

#[tokio::test]
async fn test_full_buffer_sheds_session_without_blocking() {
    let hub = start_hub(StubDirectory::default());
    let (bob, _bob_rx) = Session::new("bob", Vec::<String>::new(), 1);
    hub.handle.register(bob.clone()).await.unwrap();

    for i in 0..3 {
        hub.handle
            .broadcast(ChatMessage::direct("alice", "bob", &format!("m{i}")))
            .await
            .unwrap();
    }

    let snapshot = hub.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.user_sessions("bob"), 0);
    assert!(bob.is_closed());
}

#[tokio::test]
async fn test_message_with_two_targets_is_rejected_before_persistence() {
    let hub = start_hub(StubDirectory::default());
    let mut msg = ChatMessage::direct("alice", "bob", "hi");
    msg.group_id = Some("g1".to_string());
    let id = msg.id.clone();

    let err = hub.handle.broadcast(msg).await.unwrap_err();
    assert!(matches!(err, HubError::InvalidMessage(_)));

    hub.handle.snapshot().await.unwrap();
    assert!(hub.store.fetch(&id).await.unwrap_err().is_not_found());
    assert!(hub.store.pending_for_user("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_typing_skips_sender_sessions() {
    let hub = start_hub(StubDirectory::default());
    let (alice_phone, mut alice_phone_rx) = Session::new("alice", ["g1"], 8);
    let (alice_laptop, mut alice_laptop_rx) = Session::new("alice", ["g1"], 8);
    let (bob, mut bob_rx) = Session::new("bob", ["g1"], 8);
    let (carol, mut carol_rx) = Session::new("carol", ["g2"], 8);
    for session in [&alice_phone, &alice_laptop, &bob, &carol] {
        hub.handle.register(session.clone()).await.unwrap();
    }

    hub.handle
        .typing(TypingEvent::new("g1", "alice", true))
        .await
        .unwrap();

    let typing = next_json(&mut bob_rx).await;
    assert_eq!(typing["user_id"], "alice");
    assert_eq!(typing["is_typing"], true);
    assert_silent(&mut alice_phone_rx).await;
    assert_silent(&mut alice_laptop_rx).await;
    assert_silent(&mut carol_rx).await;
}

#[tokio::test]
async fn test_direct_typing_reaches_peer() {
    let hub = start_hub(StubDirectory::default());
    let (bob, mut bob_rx) = Session::new("bob", Vec::<String>::new(), 8);
    hub.handle.register(bob).await.unwrap();

    hub.handle
        .typing(TypingEvent::new("bob", "alice", false))
        .await
        .unwrap();

    assert_eq!(next_json(&mut bob_rx).await["conversation_id"], "bob");
}

#[tokio::test]
async fn test_sweep_removes_only_stale_sessions() {
    let hub = start_hub(StubDirectory::default());
    let (idle, _idle_rx) = Session::new("idle", Vec::<String>::new(), 4);
    let (active, _active_rx) = Session::new("active", Vec::<String>::new(), 4);
    idle.set_last_seen(Utc::now() - ChronoDuration::minutes(20));
    hub.handle.register(idle.clone()).await.unwrap();
    hub.handle.register(active.clone()).await.unwrap();

    let reaped = hub
        .handle
        .sweep(Utc::now() - ChronoDuration::minutes(10))
        .await
        .unwrap();

    assert_eq!(reaped, 1);
    let snapshot = hub.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.user_sessions("idle"), 0);
    assert_eq!(snapshot.user_sessions("active"), 1);
    assert!(idle.is_closed());
    assert!(!active.is_closed());
}

#[tokio::test]
async fn test_unknown_domain_event_does_not_stop_dispatch() {
    let hub = start_hub(StubDirectory::default());
    let (bob, mut bob_rx) = Session::new("bob", Vec::<String>::new(), 8);
    hub.handle.register(bob).await.unwrap();

    hub.handle
        .domain_event(DomainEvent::new("UnknownThing", json!({"x": 1})))
        .await
        .unwrap();
    hub.handle
        .domain_event(DomainEvent::new("PostCreated", json!({"id": "p1"})))
        .await
        .unwrap();

    let envelope = next_json(&mut bob_rx).await;
    assert_eq!(envelope["type"], "PostCreated");
    assert_eq!(envelope["data"]["id"], "p1");
    assert_silent(&mut bob_rx).await;
}

#[tokio::test]
async fn test_comment_event_reaches_post_author_only() {
    let hub = start_hub(StubDirectory::default().with_post("p1", "dave"));
    let (dave, mut dave_rx) = Session::new("dave", Vec::<String>::new(), 8);
    let (erin, mut erin_rx) = Session::new("erin", Vec::<String>::new(), 8);
    hub.handle.register(dave).await.unwrap();
    hub.handle.register(erin).await.unwrap();

    hub.handle
        .domain_event(DomainEvent::new(
            "CommentCreated",
            json!({"id": "c1", "post_id": "p1", "user_id": "erin"}),
        ))
        .await
        .unwrap();

    let envelope = next_json(&mut dave_rx).await;
    assert_eq!(envelope["type"], "CommentCreated");
    assert_eq!(envelope["data"]["id"], "c1");
    assert_silent(&mut erin_rx).await;
}

#[tokio::test]
async fn test_notification_reaches_online_recipient_only() {
    let hub = start_hub(StubDirectory::default());
    let (bob, mut bob_rx) = Session::new("bob", Vec::<String>::new(), 8);
    hub.handle.register(bob).await.unwrap();

    let notification: Notification = serde_json::from_value(json!({
        "id": "n1",
        "recipient_id": "bob",
        "sender_id": "alice",
        "type": "comment",
        "content": "alice commented on your post"
    }))
    .unwrap();
    let mut offline = notification.clone();
    offline.id = "n2".to_string();
    offline.recipient_id = "carol".to_string();

    hub.handle.notification(notification).await.unwrap();
    hub.handle.notification(offline).await.unwrap();

    let envelope = next_json(&mut bob_rx).await;
    assert_eq!(envelope["type"], "NOTIFICATION_CREATED");
    assert_eq!(envelope["data"]["id"], "n1");
    assert_silent(&mut bob_rx).await;
    assert!(hub.store.pending_for_user("carol").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_failure_still_fans_out() {
    let hub = start_hub(StubDirectory::default());
    hub.store.set_fail_writes(true);
    let (bob, mut bob_rx) = Session::new("bob", Vec::<String>::new(), 8);
    hub.handle.register(bob).await.unwrap();

    hub.handle
        .broadcast(ChatMessage::direct("alice", "bob", "still here"))
        .await
        .unwrap();

    assert_eq!(next_json(&mut bob_rx).await["content"], "still here");
}

#[tokio::test]
async fn test_direct_message_echoes_to_sender_devices() {
    let hub = start_hub(StubDirectory::default());
    let (alice, mut alice_rx) = Session::new("alice", Vec::<String>::new(), 8);
    let (bob, mut bob_rx) = Session::new("bob", Vec::<String>::new(), 8);
    hub.handle.register(alice).await.unwrap();
    hub.handle.register(bob).await.unwrap();

    let msg = ChatMessage::direct("alice", "bob", "hi");
    let id = msg.id.clone();
    hub.handle.broadcast(msg).await.unwrap();

    assert_eq!(next_json(&mut bob_rx).await["id"], id.as_str());
    assert_eq!(next_json(&mut alice_rx).await["id"], id.as_str());
    hub.handle.snapshot().await.unwrap();
    assert!(hub.store.pending_for_user("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reused_id_from_other_sender_does_not_replace_message() {
    let hub = start_hub(StubDirectory::default());
    let original = ChatMessage::direct("alice", "bob", "while you were away");
    let id = original.id.clone();
    hub.handle.broadcast(original).await.unwrap();

    let (carol, mut carol_rx) = Session::new("carol", Vec::<String>::new(), 8);
    hub.handle.register(carol).await.unwrap();
    let mut forged = ChatMessage::direct("mallory", "carol", "clobbered");
    forged.id = id.clone();
    hub.handle.broadcast(forged).await.unwrap();
    hub.handle.snapshot().await.unwrap();

    assert_silent(&mut carol_rx).await;
    assert_eq!(hub.store.fetch(&id).await.unwrap().content, "while you were away");

    let (bob, mut bob_rx) = Session::new("bob", Vec::<String>::new(), 8);
    hub.handle.register(bob).await.unwrap();
    let replayed = next_json(&mut bob_rx).await;
    assert_eq!(replayed["id"], id.as_str());
    assert_eq!(replayed["content"], "while you were away");
}
