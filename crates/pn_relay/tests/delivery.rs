//! Streaming delivery: offline queue + flush ordering, immediate push,
//! subscription displacement, and upgrade authorization.

use std::time::Duration;

use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use pn_proto::api::{Delivery, DiagnosticsResponse, SendMessageResponse};
use pn_proto::envelope::{Envelope, EnvelopeType};
use pn_relay::{app, RelayState};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_WINDOW: Duration = Duration::from_secs(5);

struct Relay {
    base: String,
    ws_base: String,
    _dir: TempDir,
}

async fn spawn_relay() -> Relay {
    let dir = TempDir::new().unwrap();
    let state = RelayState::open(&dir.path().join("relay.db")).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    Relay { base: format!("http://{addr}"), ws_base: format!("ws://{addr}"), _dir: dir }
}

async fn register(relay: &Relay, id: &str) {
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/register", relay.base))
        .json(&serde_json::json!({"id": id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

async fn send(relay: &Relay, from: &str, to: &str, plaintext: &[u8]) -> SendMessageResponse {
    let envelope = Envelope::new(from, to, EnvelopeType::Subsequent, plaintext);
    reqwest::Client::new()
        .post(format!("{}/v1/messages", relay.base))
        .json(&serde_json::json!({"from": from, "to": to, "envelope": envelope}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn subscribe(relay: &Relay, client_id: &str) -> WsClient {
    let (ws, _) = connect_async(format!("{}/ws?client_id={client_id}", relay.ws_base))
        .await
        .unwrap();
    ws
}

async fn next_delivery(ws: &mut WsClient) -> Delivery {
    loop {
        let msg = timeout(RECV_WINDOW, ws.next())
            .await
            .expect("timed out waiting for a delivery")
            .expect("stream ended")
            .expect("socket error");
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn diagnostics(relay: &Relay) -> DiagnosticsResponse {
    reqwest::get(format!("{}/diagnostics", relay.base)).await.unwrap().json().await.unwrap()
}

#[tokio::test]
async fn upgrade_is_authorized() {
    let relay = spawn_relay().await;

    // Missing client_id: 400.
    let err = connect_async(format!("{}/ws", relay.ws_base)).await.unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 400),
        other => panic!("expected HTTP error, got {other:?}"),
    }

    // Unregistered client_id: 401.
    let err = connect_async(format!("{}/ws?client_id=ghost", relay.ws_base)).await.unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn offline_queue_flushes_in_send_order() {
    let relay = spawn_relay().await;
    register(&relay, "alice").await;
    register(&relay, "bob").await;

    for i in 0..3 {
        let resp = send(&relay, "bob", "alice", format!("msg-{i}").as_bytes()).await;
        assert!(resp.queued);
        assert!(!resp.delivered, "no subscription yet");
    }
    assert_eq!(diagnostics(&relay).await.counts.queued_messages, 3);

    let mut ws = subscribe(&relay, "alice").await;
    for i in 0..3 {
        let delivery = next_delivery(&mut ws).await;
        assert_eq!(delivery.from, "bob");
        assert_eq!(delivery.to, "alice");
        assert_eq!(delivery.envelope.body_bytes().unwrap(), format!("msg-{i}").as_bytes());
    }

    // Flush flipped every delivered flag.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let diag = diagnostics(&relay).await;
    assert_eq!(diag.counts.queued_messages, 0);
    assert_eq!(diag.queue_depth_histogram.zero, 2);
}

#[tokio::test]
async fn live_subscription_gets_immediate_push() {
    let relay = spawn_relay().await;
    register(&relay, "alice").await;
    register(&relay, "bob").await;

    let mut ws = subscribe(&relay, "alice").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = send(&relay, "bob", "alice", b"hello").await;
    assert!(resp.delivered, "push should succeed while subscribed");

    let delivery = next_delivery(&mut ws).await;
    assert_eq!(delivery.envelope.body_bytes().unwrap(), b"hello");

    assert_eq!(diagnostics(&relay).await.counts.queued_messages, 0);
}

#[tokio::test]
async fn queued_messages_survive_until_a_subscription_appears() {
    let relay = spawn_relay().await;
    register(&relay, "alice").await;
    register(&relay, "bob").await;

    send(&relay, "bob", "alice", b"parked").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut ws = subscribe(&relay, "alice").await;
    let delivery = next_delivery(&mut ws).await;
    assert_eq!(delivery.envelope.body_bytes().unwrap(), b"parked");
}

#[tokio::test]
async fn new_subscription_supersedes_the_old_one() {
    let relay = spawn_relay().await;
    register(&relay, "alice").await;
    register(&relay, "bob").await;

    let mut first = subscribe(&relay, "alice").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = subscribe(&relay, "alice").await;

    // The first subscription is closed with the displacement code.
    let close = timeout(RECV_WINDOW, first.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended without a close frame")
        .expect("socket error");
    match close {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4000);
            assert_eq!(frame.reason.as_str(), "superseded");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    // Deliveries flow only to the survivor.
    let resp = send(&relay, "bob", "alice", b"after displacement").await;
    assert!(resp.delivered);
    let delivery = next_delivery(&mut second).await;
    assert_eq!(delivery.envelope.body_bytes().unwrap(), b"after displacement");

    // The displaced stream carries nothing further.
    match timeout(Duration::from_millis(500), first.next()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(Ok(tungstenite::Message::Close(_)))) => {}
        Ok(Some(other)) => panic!("displaced subscription received {other:?}"),
    }

    assert_eq!(diagnostics(&relay).await.counts.active_connections, 1);
}
