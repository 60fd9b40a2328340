use super::*;
use axum::{body, body::Body, http::Request};
use crate::config::Settings;
use shared::{
    domain::{MessageId, SenderId},
    protocol::RealtimeFrame,
};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn test_state() -> Arc<AppState> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    Arc::new(AppState::new(storage, &Settings::default()))
}

async fn test_app() -> (Router, Arc<AppState>) {
    let state = test_state().await;
    (build_router(state.clone()), state)
}

fn json_post(uri: &str, value: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .expect("request")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

async fn send(app: &Router, sender: &str, body: &str, timestamp: i64) -> MessageId {
    let response = app
        .clone()
        .oneshot(json_post(
            "/send-message",
            serde_json::json!({
                "senderId": sender,
                "displayName": sender.to_uppercase(),
                "avatarRef": null,
                "timestamp": timestamp,
                "body": body,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let dto: SendMessageResponse =
        serde_json::from_str(&body_text(response).await).expect("json");
    dto.message_id
}

async fn window(app: &Router, start: &str, end: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::get(format!("/get-messages?start={start}&end={end}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _state) = test_app().await;
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

#[tokio::test]
async fn send_then_get_returns_window_in_order() {
    let (app, _state) = test_app().await;
    let first = send(&app, "alice", "one", 1_700_000_000_000).await;
    let second = send(&app, "alice", "two", 1_700_000_010_000).await;
    send(&app, "bob", "three", 1_700_000_020_000).await;

    let response = window(&app, "0", "2").await;
    assert_eq!(response.status(), StatusCode::OK);
    let dto: MessagesResponse = serde_json::from_str(&body_text(response).await).expect("json");
    let ids: Vec<_> = dto.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![Some(first), Some(second)]);
    assert_eq!(dto.messages[0].sender_id, SenderId::new("alice"));
}

#[tokio::test]
async fn get_messages_past_tail_is_empty_list() {
    let (app, _state) = test_app().await;
    send(&app, "alice", "one", 1_700_000_000_000).await;

    let response = window(&app, "5", "9").await;
    assert_eq!(response.status(), StatusCode::OK);
    let dto: MessagesResponse = serde_json::from_str(&body_text(response).await).expect("json");
    assert!(dto.messages.is_empty());
}

#[tokio::test]
async fn get_messages_rejects_malformed_bounds_with_text() {
    let (app, _state) = test_app().await;
    for (start, end) in [("abc", "3"), ("-1", "3"), ("4", "2")] {
        let response = window(&app, start, end).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body_text(response).await.is_empty());
    }

    let response = app
        .oneshot(
            Request::get("/get-messages?start=1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn delete_is_idempotent_and_unknown_ids_fail() {
    let (app, _state) = test_app().await;
    let id = send(&app, "alice", "bye", 1_700_000_000_000).await;

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(json_post(
                "/delete-message",
                serde_json::json!({ "message_id": id.0 }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.is_empty());
    }

    let response = app
        .clone()
        .oneshot(json_post(
            "/delete-message",
            serde_json::json!({ "message_id": 999 }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = app
        .oneshot(json_post("/delete-message", serde_json::json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(response).await.contains("message_id"));
}

#[tokio::test]
async fn update_persists_body_and_flags() {
    let (app, state) = test_app().await;
    let id = send(&app, "alice", "draft", 1_700_000_000_000).await;

    let response = app
        .clone()
        .oneshot(json_post(
            "/update-message",
            serde_json::json!({
                "message_id": id.0,
                "message": "final",
                "showAvatar": true,
                "showTimestamp": false,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let stored = state
        .api
        .storage
        .get(id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(stored.body, "final");
    assert_eq!((stored.show_avatar, stored.show_timestamp), (1, 0));
}

#[tokio::test]
async fn update_with_missing_fields_is_a_server_error() {
    let (app, _state) = test_app().await;
    let response = app
        .oneshot(json_post(
            "/update-message",
            serde_json::json!({ "message_id": 1 }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn unknown_routes_are_teapots() {
    let (app, _state) = test_app().await;
    let response = app
        .oneshot(Request::get("/nope").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(body_text(response).await, "I'm a teapot");
}

async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    let state = test_state().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn next_frame(socket: &mut ClientSocket) -> RealtimeFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame");
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame json");
        }
    }
}

async fn open_socket(addr: SocketAddr) -> ClientSocket {
    let (mut socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    match next_frame(&mut socket).await {
        RealtimeFrame::Notification { welcome, .. } => assert!(welcome),
        other => panic!("expected welcome, got {other:?}"),
    }
    socket
}

#[tokio::test]
async fn websocket_relays_to_other_sessions_only() {
    let (addr, state) = spawn_server().await;
    let mut alice = open_socket(addr).await;
    let mut bob = open_socket(addr).await;
    assert_eq!(state.hub.session_count().await, 2);

    let frame = serde_json::json!({
        "type": "message",
        "message": {
            "message_id": 7,
            "senderId": "alice",
            "displayName": "Alice",
            "avatarRef": null,
            "timestamp": 1_700_000_000_000_i64,
            "body": "hello",
        }
    });
    alice
        .send(tungstenite::Message::Text(frame.to_string()))
        .await
        .expect("send");

    match next_frame(&mut bob).await {
        RealtimeFrame::Message { message } => {
            assert_eq!(message.id, Some(MessageId(7)));
            assert_eq!(message.body, "hello");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    let echo = tokio::time::timeout(Duration::from_millis(200), alice.next()).await;
    assert!(echo.is_err(), "originator must not receive its own frame");
}

#[tokio::test]
async fn websocket_survives_malformed_frames() {
    let (addr, _state) = spawn_server().await;
    let mut alice = open_socket(addr).await;
    let mut bob = open_socket(addr).await;

    alice
        .send(tungstenite::Message::Text("{garbage".into()))
        .await
        .expect("send garbage");
    alice
        .send(tungstenite::Message::Text(
            serde_json::json!({ "type": "delete", "message_id": 3 }).to_string(),
        ))
        .await
        .expect("send delete");

    assert_eq!(
        next_frame(&mut bob).await,
        RealtimeFrame::Delete {
            message_id: MessageId(3)
        }
    );
}

#[tokio::test]
async fn closing_socket_leaves_broadcast_set() {
    let (addr, state) = spawn_server().await;
    let mut alice = open_socket(addr).await;
    let _bob = open_socket(addr).await;

    alice.close(None).await.expect("close");
    for _ in 0..50 {
        if state.hub.session_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.hub.session_count().await, 1);
}
