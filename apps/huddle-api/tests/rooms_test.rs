mod common;

use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;

fn server() -> (TestServer, huddle_api::AppState) {
    let (app, state) = common::test_app();
    (TestServer::new(app).unwrap(), state)
}

fn bearer(user_id: &str, name: &str) -> String {
    format!("Bearer {}", common::mint_token(user_id, name))
}

#[tokio::test]
async fn health_is_ok() {
    let (server, _) = server();
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    assert_eq!(resp.json::<Value>()["status"], "ok");
}

#[tokio::test]
async fn post_message_requires_token() {
    let (server, _) = server();

    let resp = server
        .post("/api/v1/rooms/general/messages")
        .json(&serde_json::json!({ "text": "hi" }))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(resp.json::<Value>()["error"]["code"], "MISSING_TOKEN");

    let resp = server
        .post("/api/v1/rooms/general/messages")
        .add_header(AUTHORIZATION, "Token abc")
        .json(&serde_json::json!({ "text": "hi" }))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    let resp = server
        .post("/api/v1/rooms/general/messages")
        .add_header(
            AUTHORIZATION,
            format!("Bearer {}", common::mint_expired_token("usr_old")),
        )
        .json(&serde_json::json!({ "text": "hi" }))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(resp.json::<Value>()["error"]["code"], "TOKEN_EXPIRED");
}

#[tokio::test]
async fn post_then_list_messages() {
    let (server, _) = server();
    let auth = bearer("usr_alice", "Alice");

    for text in ["first", "  second  "] {
        let resp = server
            .post("/api/v1/rooms/general/messages")
            .add_header(AUTHORIZATION, auth.clone())
            .json(&serde_json::json!({ "text": text }))
            .await;
        resp.assert_status(StatusCode::CREATED);
    }

    let resp = server.get("/api/v1/rooms/general/messages").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["sequence"], 1);
    assert_eq!(data[1]["text"], "second");
    assert_eq!(data[1]["sender_id"], "usr_alice");
    assert_eq!(data[1]["sender_name"], "Alice");
    assert!(body["gap"].is_null());

    let resp = server.get("/api/v1/rooms/general/messages?after=1").await;
    let body: Value = resp.json();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["sequence"], 2);
}

#[tokio::test]
async fn history_reports_gap_past_window() {
    let mut config = common::test_config();
    config.history_capacity = 2;
    let state = common::test_state_with(config);
    let server = TestServer::new(huddle_api::routes::router().with_state(state)).unwrap();
    let auth = bearer("usr_alice", "Alice");

    for text in ["one", "two", "three"] {
        server
            .post("/api/v1/rooms/general/messages")
            .add_header(AUTHORIZATION, auth.clone())
            .json(&serde_json::json!({ "text": text }))
            .await
            .assert_status(StatusCode::CREATED);
    }

    let body: Value = server
        .get("/api/v1/rooms/general/messages?after=0")
        .await
        .json();
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["gap"]["requested_after"], 0);
    assert_eq!(body["gap"]["resumes_at"], 2);
}

#[tokio::test]
async fn invalid_messages_are_rejected() {
    let (server, _) = server();
    let auth = bearer("usr_alice", "Alice");

    let resp = server
        .post("/api/v1/rooms/general/messages")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&serde_json::json!({ "text": "   " }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["details"][0]["field"], "text");

    let resp = server
        .post("/api/v1/rooms/bad%20room/messages")
        .add_header(AUTHORIZATION, auth)
        .json(&serde_json::json!({ "text": "hello" }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>()["error"]["code"], "INVALID_ROOM");

    let body: Value = server.get("/api/v1/rooms/general/messages").await.json();
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn list_rooms_shows_only_occupied_rooms() {
    let (server, state) = server();
    let auth = bearer("usr_alice", "Alice");

    // History alone does not make a room.
    server
        .post("/api/v1/rooms/empty/messages")
        .add_header(AUTHORIZATION, auth.clone())
        .json(&serde_json::json!({ "text": "echo" }))
        .await
        .assert_status(StatusCode::CREATED);

    let token = common::mint_token("usr_bob", "Bob");
    let session_id = state.hub.connect(&token).await.unwrap();
    state.hub.join_room(&session_id, "lobby", None).unwrap();
    state.hub.publish(&session_id, "hello").unwrap();

    let body: Value = server.get("/api/v1/rooms").await.json();
    assert_eq!(
        body["data"],
        serde_json::json!([{ "room_id": "lobby", "member_count": 1, "last_sequence": 1 }])
    );
}

#[tokio::test]
async fn rest_publish_reaches_joined_sessions() {
    let (server, state) = server();
    let token = common::mint_token("usr_bob", "Bob");
    let session_id = state.hub.connect(&token).await.unwrap();
    let mut stream = state.hub.on_message(&session_id).unwrap();
    state.hub.join_room(&session_id, "general", None).unwrap();

    server
        .post("/api/v1/rooms/general/messages")
        .add_header(AUTHORIZATION, bearer("usr_alice", "Alice"))
        .json(&serde_json::json!({ "text": "from rest" }))
        .await
        .assert_status(StatusCode::CREATED);

    match stream.next().await {
        Some(huddle_api::chat::StreamEvent::Message(m)) => {
            assert_eq!(m.text, "from rest");
            assert_eq!(m.sender_id, "usr_alice");
        }
        other => panic!("expected message, got {other:?}"),
    }
}
