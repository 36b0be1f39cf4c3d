//! Request/response surface: registration, bundles, message ingest,
//! diagnostics, and the strict-schema error shape.

use tempfile::TempDir;

use pn_proto::api::{DiagnosticsResponse, SendMessageResponse};
use pn_proto::envelope::{Envelope, EnvelopeType};
use pn_relay::{app, RelayState};

async fn spawn_relay() -> (String, TempDir) {
    let dir = TempDir::new().unwrap();
    let state = RelayState::open(&dir.path().join("relay.db")).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    (format!("http://{addr}"), dir)
}

async fn register(base: &str, id: &str) {
    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/register"))
        .json(&serde_json::json!({"id": id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

fn bundle_json(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "identity_pub": "AAAA",
        "registration_id": 7,
        "device": 1,
        "signed_prekey_id": 1,
        "signed_prekey_pub": "AAAA",
        "signed_prekey_sig": "AAAA",
        "one_time_prekey_id": 1,
        "one_time_prekey_pub": "AAAA",
        "kem_prekey_id": 1,
        "kem_prekey_pub": "AAAA",
        "kem_prekey_sig": "AAAA",
    })
}

#[tokio::test]
async fn health_is_plain_ok() {
    let (base, _dir) = spawn_relay().await;
    let body = reqwest::get(format!("{base}/health")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn register_is_idempotent() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .post(format!("{base}/v1/register"))
            .json(&serde_json::json!({"id": "alice"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["id"], "alice");
    }

    let diag: DiagnosticsResponse =
        reqwest::get(format!("{base}/diagnostics")).await.unwrap().json().await.unwrap();
    assert_eq!(diag.counts.users, 1);
}

#[tokio::test]
async fn schema_errors_are_json_400() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/register"))
        .json(&serde_json::json!({"name": "alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "schema_error");
}

#[tokio::test]
async fn bundle_upload_requires_registration() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/prekeys"))
        .json(&serde_json::json!({"id": "ghost", "bundle": bundle_json("ghost")}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "user_not_registered");
}

#[tokio::test]
async fn bundle_roundtrip_last_write_wins() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();
    register(&base, "alice").await;

    for registration_id in [7, 8] {
        let mut bundle = bundle_json("alice");
        bundle["registration_id"] = registration_id.into();
        let resp = client
            .post(format!("{base}/v1/prekeys"))
            .json(&serde_json::json!({"id": "alice", "bundle": bundle}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let body: serde_json::Value = client
        .get(format!("{base}/v1/prekeys/alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["id"], "alice");
    assert_eq!(body["bundle"]["registration_id"], 8);
}

#[tokio::test]
async fn missing_bundle_is_404() {
    let (base, _dir) = spawn_relay().await;
    register(&base, "alice").await;

    let resp = reqwest::get(format!("{base}/v1/prekeys/alice")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "bundle_not_found");
}

#[tokio::test]
async fn send_requires_registered_recipient() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();
    register(&base, "bob").await;

    let envelope = Envelope::new("bob", "alice", EnvelopeType::Subsequent, b"ct");
    let resp = client
        .post(format!("{base}/v1/messages"))
        .json(&serde_json::json!({"from": "bob", "to": "alice", "envelope": envelope}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "recipient_not_registered");
}

#[tokio::test]
async fn send_queues_when_recipient_offline() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();
    register(&base, "alice").await;
    register(&base, "bob").await;

    let envelope = Envelope::new("bob", "alice", EnvelopeType::Subsequent, b"ct");
    let resp: SendMessageResponse = client
        .post(format!("{base}/v1/messages"))
        .json(&serde_json::json!({"from": "bob", "to": "alice", "envelope": envelope}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(resp.ok);
    assert!(resp.queued);
    assert!(!resp.delivered);

    let diag: DiagnosticsResponse =
        reqwest::get(format!("{base}/diagnostics")).await.unwrap().json().await.unwrap();
    assert_eq!(diag.counts.queued_messages, 1);
    assert_eq!(diag.queue_depth_histogram.low, 1);
    // bob is registered with nothing pending.
    assert_eq!(diag.queue_depth_histogram.zero, 1);
}

#[tokio::test]
async fn send_rejects_mismatched_addressing() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();
    register(&base, "alice").await;
    register(&base, "bob").await;

    let envelope = Envelope::new("bob", "alice", EnvelopeType::Subsequent, b"ct");
    let resp = client
        .post(format!("{base}/v1/messages"))
        .json(&serde_json::json!({"from": "mallory", "to": "alice", "envelope": envelope}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn metrics_ingest_replaces_snapshot() {
    let (base, _dir) = spawn_relay().await;
    let client = reqwest::Client::new();

    let diag: DiagnosticsResponse =
        reqwest::get(format!("{base}/diagnostics")).await.unwrap().json().await.unwrap();
    assert!(diag.metrics.is_none());

    let metrics = serde_json::json!({
        "hostname": "probe-1",
        "platform": "linux",
        "cpu_load_pct": 12.5,
        "mem_used_mb": 900.0,
        "mem_total_mb": 4096.0,
        "uptime_sec": 55,
        "collected_at": "2026-08-01T10:00:00Z",
    });
    let resp = client
        .post(format!("{base}/diagnostics/metrics"))
        .json(&metrics)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let diag: DiagnosticsResponse =
        reqwest::get(format!("{base}/diagnostics")).await.unwrap().json().await.unwrap();
    assert_eq!(diag.metrics.unwrap().hostname, "probe-1");
}
