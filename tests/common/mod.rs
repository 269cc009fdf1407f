#![allow(dead_code)]

//! Shared helpers for the integration tests: spawn a server on an ephemeral
//! port, register users over the real REST surface, open WebSockets.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use agora_server::config::RealtimeConfig;
use agora_server::routes;
use agora_server::state::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
}

/// Small queues and short windows so the edge paths are reachable in tests.
pub fn test_realtime_config() -> RealtimeConfig {
    RealtimeConfig {
        outbound_queue_capacity: 16,
        replay_retention: 32,
        idle_timeout_secs: 30,
        deletion_grace_days: 7,
        sweep_interval_secs: 3600,
    }
}

/// Start the server on a random port with a throwaway data dir.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(test_realtime_config()).await
}

pub async fn start_test_server_with(realtime: RealtimeConfig) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = agora_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = agora_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let encryption_key = agora_server::auth::jwt::load_or_generate_encryption_key(&data_dir)
        .expect("Failed to generate encryption key");

    let state = AppState::build(db, jwt_secret, encryption_key, realtime)
        .expect("Failed to build app state");

    let app = routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        client: reqwest::Client::new(),
    }
}

pub struct TestUser {
    pub user_id: String,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
    pub is_admin: bool,
}

/// Register an account. The first one per server becomes the platform admin.
pub async fn register(server: &TestServer, username: &str) -> TestUser {
    let resp = server
        .client
        .post(format!("{}/api/auth/register", server.base_url))
        .json(&json!({"username": username, "password": "correct horse"}))
        .send()
        .await
        .expect("register request");
    assert_eq!(resp.status(), 200, "register {} failed", username);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    let data = &body["data"];
    TestUser {
        user_id: data["user_id"].as_str().unwrap().to_string(),
        username: data["username"].as_str().unwrap().to_string(),
        access_token: data["access_token"].as_str().unwrap().to_string(),
        refresh_token: data["refresh_token"].as_str().unwrap().to_string(),
        is_admin: data["is_admin"].as_bool().unwrap(),
    }
}

/// Create a room and return its id.
pub async fn create_room(server: &TestServer, user: &TestUser, name: &str, kind: &str) -> String {
    let body = post_json(
        server,
        user,
        "/api/rooms",
        json!({"name": name, "kind": kind}),
    )
    .await;
    assert_eq!(body["success"], true, "create_room failed: {}", body);
    body["data"]["id"].as_str().unwrap().to_string()
}

pub async fn post_json(server: &TestServer, user: &TestUser, path: &str, body: Value) -> Value {
    server
        .client
        .post(format!("{}{}", server.base_url, path))
        .bearer_auth(&user.access_token)
        .json(&body)
        .send()
        .await
        .expect("POST request")
        .json()
        .await
        .expect("JSON response")
}

pub async fn get_json(server: &TestServer, user: &TestUser, path: &str) -> Value {
    server
        .client
        .get(format!("{}{}", server.base_url, path))
        .bearer_auth(&user.access_token)
        .send()
        .await
        .expect("GET request")
        .json()
        .await
        .expect("JSON response")
}

/// Open an authenticated WebSocket and send the hello handshake.
pub async fn connect_ws(server: &TestServer, user: &TestUser) -> WsStream {
    connect_ws_resuming(server, user, json!({})).await
}

pub async fn connect_ws_resuming(server: &TestServer, user: &TestUser, resume: Value) -> WsStream {
    let url = format!("ws://{}/ws?token={}", server.addr, user.access_token);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("WebSocket connect");
    ws.send(Message::Text(
        json!({"type": "hello", "resume": resume}).to_string().into(),
    ))
    .await
    .expect("send hello");
    ws
}

/// Read frames until one satisfies the predicate, skipping the rest
/// (presence churn, typing, ready acks). Panics after the deadline.
pub async fn recv_frame<F>(ws: &mut WsStream, mut pred: F) -> Value
where
    F: FnMut(&Value) -> bool,
{
    let deadline = Duration::from_secs(3);
    loop {
        match tokio::time::timeout(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(&text).expect("frame JSON");
                if pred(&frame) {
                    return frame;
                }
            }
            Ok(Some(Ok(_))) => continue,
            other => panic!("WebSocket ended while waiting for frame: {:?}", other),
        }
    }
}

/// Assert no frame matching the predicate arrives within a short window.
pub async fn assert_no_frame<F>(ws: &mut WsStream, mut pred: F)
where
    F: FnMut(&Value) -> bool,
{
    loop {
        match tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(&text).expect("frame JSON");
                assert!(!pred(&frame), "unexpected frame: {}", frame);
            }
            Ok(Some(Ok(_))) => continue,
            _ => return,
        }
    }
}

pub async fn send_frame(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}
