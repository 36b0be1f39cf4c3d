//! pn_relay — Postern store-and-forward relay
//!
//! A combined request/response and streaming server. It persists
//! registrations, prekey bundles, and queued ciphertext envelopes; routes
//! messages to online recipients; and serves pending messages on
//! (re)connection. The relay stores only envelopes and metadata — it cannot
//! derive plaintext (the whole point).
//!
//! Delivery guarantees:
//! - at-least-once: an accepted message is delivered at least once or stays
//!   queued with `delivered = 0` indefinitely
//! - in-order per recipient: flush preserves ingest order
//! - no dedup here: clients may see duplicates across reconnect windows and
//!   dedup on application-layer ids

pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use error::RelayError;
pub use state::RelayState;

/// Build the full relay router over shared state.
pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/v1/register", post(routes::register))
        .route("/v1/prekeys", post(routes::upload_bundle))
        .route("/v1/prekeys/{id}", get(routes::fetch_bundle))
        .route("/v1/messages", post(routes::send_message))
        .route("/diagnostics", get(routes::diagnostics))
        .route("/diagnostics/metrics", post(routes::ingest_metrics))
        .route("/health", get(routes::health))
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
