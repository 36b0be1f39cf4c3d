//! Request/response handlers. All bodies are JSON and strict-schema:
//! extraction goes through `serde_json::Value` so every malformed input maps
//! to the same 400 `{error: "schema_error"}` shape.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::de::DeserializeOwned;
use tracing::info;
use uuid::Uuid;

use pn_proto::api::{
    DiagnosticsCounts, DiagnosticsResponse, FetchBundleResponse, OkResponse, RegisterRequest,
    RegisterResponse, SendMessageRequest, SendMessageResponse, UploadBundleRequest,
};
use pn_proto::api::Delivery;
use pn_proto::app::HostMetrics;

use crate::db;
use crate::error::RelayError;
use crate::state::RelayState;

fn parse<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, RelayError> {
    serde_json::from_value(body).map_err(|e| RelayError::Schema(e.to_string()))
}

/// POST /v1/register — idempotent user registration.
pub async fn register(
    State(state): State<RelayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<RegisterResponse>, RelayError> {
    let req: RegisterRequest = parse(body)?;
    if req.id.is_empty() {
        return Err(RelayError::Schema("id must be non-empty".into()));
    }
    db::register_user(&state.pool, &req.id).await?;
    info!(id = %req.id, "user registered");
    Ok(Json(RegisterResponse { id: req.id }))
}

/// POST /v1/prekeys — upsert a user's bundle (last write wins).
pub async fn upload_bundle(
    State(state): State<RelayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<OkResponse>, RelayError> {
    let req: UploadBundleRequest = parse(body)?;
    if !db::user_exists(&state.pool, &req.id).await? {
        return Err(RelayError::UserNotRegistered);
    }
    let bundle_json = serde_json::to_string(&req.bundle)
        .map_err(|e| RelayError::Schema(e.to_string()))?;
    db::upsert_bundle(&state.pool, &req.id, &bundle_json).await?;
    info!(id = %req.id, "prekey bundle uploaded");
    Ok(Json(OkResponse { ok: true }))
}

/// GET /v1/prekeys/{id}
pub async fn fetch_bundle(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Result<Json<FetchBundleResponse>, RelayError> {
    let bundle_json = db::fetch_bundle(&state.pool, &id)
        .await?
        .ok_or(RelayError::BundleNotFound)?;
    let bundle =
        serde_json::from_str(&bundle_json).map_err(|e| RelayError::Schema(e.to_string()))?;
    Ok(Json(FetchBundleResponse { id, bundle }))
}

/// POST /v1/messages — persist, then attempt an immediate push.
pub async fn send_message(
    State(state): State<RelayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<SendMessageResponse>, RelayError> {
    let req: SendMessageRequest = parse(body)?;
    req.envelope
        .validate()
        .map_err(|e| RelayError::Schema(e.to_string()))?;
    if req.envelope.sender != req.from || req.envelope.recipient != req.to {
        return Err(RelayError::Schema("envelope addressing does not match request".into()));
    }
    if !db::user_exists(&state.pool, &req.to).await? {
        return Err(RelayError::RecipientNotRegistered);
    }

    let msg_id = Uuid::new_v4().to_string();
    let envelope_json =
        serde_json::to_string(&req.envelope).map_err(|e| RelayError::Schema(e.to_string()))?;
    db::insert_message(&state.pool, &msg_id, &req.from, &req.to, &envelope_json).await?;

    // Push to a live subscription if there is one; failure leaves the row
    // queued for the next flush.
    let delivered = state
        .try_push(Delivery { from: req.from.clone(), to: req.to.clone(), envelope: req.envelope })
        .await;
    if delivered {
        db::mark_delivered(&state.pool, &msg_id).await?;
    }

    info!(from = %req.from, to = %req.to, delivered, "message accepted");
    Ok(Json(SendMessageResponse { ok: true, queued: true, delivered }))
}

/// GET /diagnostics
pub async fn diagnostics(
    State(state): State<RelayState>,
) -> Result<Json<DiagnosticsResponse>, RelayError> {
    let counts = DiagnosticsCounts {
        users: db::count_users(&state.pool).await?,
        prekeys: db::count_prekeys(&state.pool).await?,
        queued_messages: db::count_queued(&state.pool).await?,
        active_connections: state.active_connections().await,
    };
    let queue_depth_histogram = db::queue_depth_histogram(&state.pool).await?;
    let metrics = state.metrics.read().await.clone();

    Ok(Json(DiagnosticsResponse {
        uptime_sec: state.uptime_sec(),
        counts,
        queue_depth_histogram,
        metrics,
    }))
}

/// POST /diagnostics/metrics — replace the in-memory host-metrics snapshot.
pub async fn ingest_metrics(
    State(state): State<RelayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<OkResponse>, RelayError> {
    let snapshot: HostMetrics = parse(body)?;
    *state.metrics.write().await = Some(snapshot);
    Ok(Json(OkResponse { ok: true }))
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
