use super::*;
use crate::config::ServerConfig;
use crate::reducer::{ClientRegistry, MERGE, MergeReducer};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN: &str = "manager-secret";

async fn serve() -> (String, AppState) {
    let config = ServerConfig { manager_token: Some(TOKEN.into()), ..ServerConfig::default() };
    let state = AppState::bootstrap(config, Arc::new(ClientRegistry::new(MergeReducer::default())))
        .await
        .expect("bootstrap");
    let app = crate::routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server failed");
    });
    (format!("ws://{addr}/ws"), state)
}

async fn open(url: &str, query: &str) -> Client {
    let (stream, _) = connect_async(format!("{url}?{query}"))
        .await
        .expect("ws connect");
    stream
}

async fn recv_json(client: &mut Client) -> Value {
    timeout(Duration::from_secs(2), async {
        loop {
            let msg = client
                .next()
                .await
                .expect("stream ended")
                .expect("ws error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str::<Value>(text.as_str()).expect("json");
            }
        }
    })
    .await
    .expect("message receive timed out")
}

/// Read until an event named `event` arrives, returning it and everything
/// received before it.
async fn recv_until(client: &mut Client, event: &str) -> (Value, Vec<Value>) {
    let mut before = Vec::new();
    loop {
        let msg = recv_json(client).await;
        if msg["event"] == event {
            return (msg, before);
        }
        before.push(msg);
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(WsMessage::text(value.to_string()))
        .await
        .expect("ws send");
}

#[tokio::test]
async fn new_client_is_provisioned_before_first_present() {
    let (url, _state) = serve().await;
    let mut client = open(&url, "client_id=c1").await;

    let (present, before) = recv_until(&mut client, "present").await;
    assert!(
        before
            .iter()
            .any(|m| m["event"] == "action" && m["data"]["action"]["type"] == "ADD_CLIENT" && m["data"]["targetClient"] == "c1"),
        "provisioning should be applied before hydration: {before:?}"
    );
    assert_eq!(present["data"]["version"], json!(1));
    assert_eq!(present["data"]["state"]["client"], json!({"id": "c1"}));
    assert!(present["data"]["state"].get("clients").is_none(), "client view must not expose other clients");
}

#[tokio::test]
async fn targeted_actions_fan_out_by_room() {
    let (url, state) = serve().await;
    let mut manager = open(&url, &format!("client_id=boss&token={TOKEN}")).await;
    let (full, _) = recv_until(&mut manager, "present").await;
    assert!(full["data"]["state"]["clients"].is_object(), "manager sees the full snapshot");

    let mut c1 = open(&url, "client_id=c1").await;
    recv_until(&mut c1, "present").await;
    let mut c2 = open(&url, "client_id=c2").await;
    recv_until(&mut c2, "present").await;
    let version_before = state.engine.get_state().version;

    send_json(&mut c1, json!({"event": "client-action", "data": {"type": MERGE, "payload": {"color": "red"}}})).await;

    let expected_version = version_before + 1;
    let (at_c1, _) = recv_until(&mut c1, "action").await;
    assert_eq!(at_c1["data"]["targetClient"], json!("c1"));
    assert_eq!(at_c1["data"]["version"], json!(expected_version));

    loop {
        let (at_manager, _) = recv_until(&mut manager, "action").await;
        if at_manager["data"]["version"] == json!(expected_version) {
            assert_eq!(at_manager["data"]["targetClient"], json!("c1"));
            break;
        }
    }

    let (notice, _) = recv_until(&mut c2, "version").await;
    assert_eq!(notice["data"], json!({"version": expected_version}));

    send_json(&mut c2, json!({"event": "present"})).await;
    let (refreshed, _) = recv_until(&mut c2, "present").await;
    assert_eq!(refreshed["data"]["state"]["client"], json!({"id": "c2"}));
}

#[tokio::test]
async fn global_action_reaches_everyone() {
    let (url, _state) = serve().await;
    let mut c1 = open(&url, "client_id=c1").await;
    recv_until(&mut c1, "present").await;
    let mut c2 = open(&url, "client_id=c2").await;
    recv_until(&mut c2, "present").await;

    send_json(&mut c2, json!({"event": "action", "data": {"type": MERGE, "payload": {"topic": "rust"}}})).await;

    for client in [&mut c1, &mut c2] {
        let (msg, _) = loop {
            let (msg, before) = recv_until(client, "action").await;
            if msg["data"]["action"]["type"] == MERGE {
                break (msg, before);
            }
        };
        assert!(msg["data"].get("targetClient").is_none());
    }

    send_json(&mut c1, json!({"event": "present"})).await;
    let (present, _) = recv_until(&mut c1, "present").await;
    assert_eq!(present["data"]["state"]["shared"]["topic"], json!("rust"));
}

#[tokio::test]
async fn null_and_present_actions_are_ignored() {
    let (url, state) = serve().await;
    let mut c1 = open(&url, "client_id=c1").await;
    recv_until(&mut c1, "present").await;
    let version = state.engine.get_state().version;

    send_json(&mut c1, json!({"event": "action", "data": null})).await;
    send_json(&mut c1, json!({"event": "action", "data": {"type": "PRESENT"}})).await;
    send_json(&mut c1, json!({"event": "client-action", "data": {"type": "PRESENT"}})).await;
    send_json(&mut c1, json!("not an event")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(state.engine.get_state().version, version);
}

#[tokio::test]
async fn healthz_reports_version() {
    let (url, _state) = serve().await;
    let addr = url
        .trim_start_matches("ws://")
        .trim_end_matches("/ws")
        .to_owned();

    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    let request = format!("GET /healthz HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
        .await
        .expect("write");
    let mut body = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut body)
        .await
        .expect("read");
    assert!(body.starts_with("HTTP/1.1 200"), "{body}");
    assert!(body.contains("\"version\":0"), "{body}");
}
