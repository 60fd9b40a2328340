use super::*;
use chrono::{TimeZone, Utc};
use shared::domain::SenderId;

fn message(id: i64) -> Message {
    Message {
        id: Some(MessageId(id)),
        sender_id: SenderId::new("alice"),
        display_name: "Alice".into(),
        avatar_ref: None,
        timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        body: "hi".into(),
        show_avatar: None,
        show_timestamp: None,
    }
}

fn registrant(uid: &str) -> Registrant {
    Registrant {
        uid: SenderId::new(uid),
        display_name: uid.to_uppercase(),
        avatar_ref: None,
    }
}

async fn connected(hub: &FanoutHub) -> (SessionId, mpsc::Receiver<RealtimeFrame>) {
    let (session, mut rx) = hub.connect().await;
    let welcome = rx.recv().await.expect("welcome");
    assert_eq!(welcome, RealtimeFrame::welcome(WELCOME_TEXT));
    (session, rx)
}

#[tokio::test]
async fn connect_sends_welcome_first() {
    let hub = FanoutHub::new(8);
    let (session, mut rx) = hub.connect().await;

    match rx.recv().await.expect("frame") {
        RealtimeFrame::Notification { welcome, message } => {
            assert!(welcome);
            assert_eq!(message, WELCOME_TEXT);
        }
        other => panic!("unexpected first frame: {other:?}"),
    }
    assert_eq!(hub.session_state(session).await, SessionState::Connected);
}

#[tokio::test]
async fn sessions_move_forward_only() {
    let hub = FanoutHub::new(8);
    let (session, _rx) = connected(&hub).await;

    assert!(hub.register(session, registrant("alice")).await);
    assert_eq!(hub.session_state(session).await, SessionState::Registered);

    hub.close(session).await;
    assert_eq!(hub.session_state(session).await, SessionState::Closed);
    assert!(!hub.register(session, registrant("alice")).await);
    assert_eq!(hub.session_state(session).await, SessionState::Closed);
    assert_eq!(hub.session_count().await, 0);
}

#[tokio::test]
async fn originator_never_receives_its_echo() {
    let hub = FanoutHub::new(8);
    let (a, mut rx_a) = connected(&hub).await;
    let (_b, mut rx_b) = connected(&hub).await;
    let (_c, mut rx_c) = connected(&hub).await;

    let delivered = hub.broadcast_create(message(1), Some(a)).await;
    assert_eq!(delivered, 2);

    for rx in [&mut rx_b, &mut rx_c] {
        assert_eq!(
            rx.recv().await.expect("frame"),
            RealtimeFrame::Message {
                message: message(1)
            }
        );
    }
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn inbound_frames_are_relayed_by_kind() {
    let hub = FanoutHub::new(8);
    let (a, _rx_a) = connected(&hub).await;
    let (_b, mut rx_b) = connected(&hub).await;

    hub.handle_inbound(a, r#"{"type":"delete","message_id":4}"#)
        .await;
    hub.handle_inbound(
        a,
        r#"{"type":"update","message_id":4,"message":"x","showAvatar":false,"showTimestamp":true}"#,
    )
    .await;

    assert_eq!(
        rx_b.recv().await.expect("delete"),
        RealtimeFrame::Delete {
            message_id: MessageId(4)
        }
    );
    match rx_b.recv().await.expect("update") {
        RealtimeFrame::Update(update) => {
            assert_eq!(update.body, "x");
            assert!(update.show_timestamp);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn register_frame_marks_session_and_is_relayed() {
    let hub = FanoutHub::new(8);
    let (a, _rx_a) = connected(&hub).await;
    let (_b, mut rx_b) = connected(&hub).await;

    hub.handle_inbound(
        a,
        r#"{"type":"register","user":{"uid":"u1","displayName":"Una","avatarRef":null}}"#,
    )
    .await;

    assert_eq!(hub.session_state(a).await, SessionState::Registered);
    match rx_b.recv().await.expect("register") {
        RealtimeFrame::Register { user } => assert_eq!(user.uid, SenderId::new("u1")),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let hub = FanoutHub::new(8);
    let (a, _rx_a) = connected(&hub).await;
    let (_b, mut rx_b) = connected(&hub).await;

    hub.handle_inbound(a, "not json").await;
    hub.handle_inbound(a, r#"{"type":"shout","message":"hey"}"#)
        .await;
    hub.handle_inbound(a, r#"{"type":"notification","message":"spoof"}"#)
        .await;

    assert!(rx_b.try_recv().is_err());
    assert_eq!(hub.session_state(a).await, SessionState::Connected);
    assert_eq!(hub.session_count().await, 2);
}

#[tokio::test]
async fn full_buffer_drops_frames_for_that_session_only() {
    let hub = FanoutHub::new(1);
    let (a, _rx_a) = connected(&hub).await;
    let (slow, _rx_slow) = hub.connect().await; // welcome still queued
    let (_fast, mut rx_fast) = connected(&hub).await;

    let delivered = hub.broadcast_delete(MessageId(1), Some(a)).await;
    assert_eq!(delivered, 1);
    assert_eq!(
        rx_fast.recv().await.expect("frame"),
        RealtimeFrame::Delete {
            message_id: MessageId(1)
        }
    );
    assert_eq!(hub.session_state(slow).await, SessionState::Connected);
}

#[tokio::test]
async fn dropped_receiver_closes_session_on_next_broadcast() {
    let hub = FanoutHub::new(8);
    let (a, _rx_a) = connected(&hub).await;
    let (gone, rx_gone) = connected(&hub).await;
    drop(rx_gone);

    let delivered = hub.broadcast_delete(MessageId(2), Some(a)).await;
    assert_eq!(delivered, 0);
    assert_eq!(hub.session_state(gone).await, SessionState::Closed);
    assert_eq!(hub.session_count().await, 1);
}

#[tokio::test]
async fn closed_session_frames_are_ignored() {
    let hub = FanoutHub::new(8);
    let (a, _rx_a) = connected(&hub).await;
    let (_b, mut rx_b) = connected(&hub).await;
    hub.close(a).await;

    hub.handle_inbound(a, r#"{"type":"delete","message_id":1}"#)
        .await;
    assert!(rx_b.try_recv().is_err());
}
