//! Streaming delivery channel.
//!
//! `GET /ws?client_id={id}` upgrades to a WebSocket. Authorization happens
//! before the upgrade: 400 when the parameter is absent, 401 when the id is
//! not registered.
//!
//! One subscription per identity: accepting a new one closes the previous
//! with code 4000 / reason "superseded" before any frame flows on the new
//! socket's behalf.
//!
//! On accept, all pending rows for the identity flush in ingest order; each
//! successful socket write flips that row's `delivered` flag. A failed write
//! stops the flush — the remainder stays queued for the next connection.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, info, warn};

use pn_proto::api::{Delivery, ErrorResponse};

use crate::db;
use crate::state::{RelayState, SubCommand};

/// Close code sent to a subscription displaced by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4000;

pub async fn upgrade(
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(client_id) = params.get("client_id").cloned() else {
        let body = ErrorResponse { error: "missing client_id".into(), details: None };
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    };

    match db::user_exists(&state.pool, &client_id).await {
        Ok(true) => {}
        Ok(false) => {
            let body = ErrorResponse { error: "client_id not registered".into(), details: None };
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }
        Err(e) => return e.into_response(),
    }

    ws.on_upgrade(move |socket| subscription(state, client_id, socket))
}

async fn subscription(state: RelayState, client_id: String, mut socket: WebSocket) {
    let conn_id = state.next_conn_id();
    let mut commands = state.subscribe(&client_id, conn_id).await;
    info!(client_id, conn_id, "subscription open");

    // Flush everything queued while the identity was offline.
    if !flush_pending(&state, &client_id, &mut socket).await {
        state.unsubscribe(&client_id, conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SubCommand::Deliver { frame, ack }) => {
                    let sent = push_frame(&mut socket, &frame).await;
                    let _ = ack.send(sent);
                    if !sent {
                        break;
                    }
                }
                Some(SubCommand::Supersede) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SUPERSEDED,
                            reason: "superseded".into(),
                        })))
                        .await;
                    debug!(client_id, conn_id, "closed superseded subscription");
                    break;
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                // The channel is server-to-client only; anything readable is
                // ignored, close or error ends the subscription.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.unsubscribe(&client_id, conn_id).await;
    info!(client_id, conn_id, "subscription closed");
}

/// Deliver queued rows oldest-first, marking each delivered after its
/// socket write succeeds. Returns false if the socket died mid-flush.
async fn flush_pending(state: &RelayState, client_id: &str, socket: &mut WebSocket) -> bool {
    let pending = match db::pending_for(&state.pool, client_id).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!(client_id, error = %e, "pending-message query failed");
            return false;
        }
    };
    let total = pending.len();

    for message in pending {
        let envelope = match serde_json::from_str(&message.envelope_json) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A row that no longer parses is unrecoverable; skip it
                // rather than wedging the queue forever.
                warn!(client_id, msg_id = %message.id, error = %e, "stored envelope unparseable");
                continue;
            }
        };
        let frame = Delivery { from: message.from_id, to: message.to_id, envelope };
        if !push_frame(socket, &frame).await {
            return false;
        }
        if let Err(e) = db::mark_delivered(&state.pool, &message.id).await {
            warn!(client_id, msg_id = %message.id, error = %e, "delivered-flag write failed");
            return false;
        }
    }

    if total > 0 {
        debug!(client_id, flushed = total, "pending queue flushed");
    }
    true
}

async fn push_frame(socket: &mut WebSocket, frame: &Delivery) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(_) => return false,
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}
