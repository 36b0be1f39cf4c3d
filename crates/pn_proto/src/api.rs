//! Relay request/response types shared between clients and the relay.
//! These map directly to JSON bodies on the wire.

use serde::{Deserialize, Serialize};

use pn_crypto::handshake::PrekeyBundle;

use crate::app::HostMetrics;
use crate::envelope::Envelope;

// ── Registration & prekeys ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadBundleRequest {
    pub id: String,
    pub bundle: PrekeyBundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBundleResponse {
    pub id: String,
    pub bundle: PrekeyBundle,
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub from: String,
    pub to: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub ok: bool,
    /// Always true once the relay accepted the message.
    pub queued: bool,
    /// True when an immediate push to a live subscription succeeded.
    pub delivered: bool,
}

/// Frame pushed over a streaming subscription, one per delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub from: String,
    pub to: String,
    pub envelope: Envelope,
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsCounts {
    pub users: u64,
    pub prekeys: u64,
    pub queued_messages: u64,
    pub active_connections: u64,
}

/// Per-recipient undelivered counts bucketed for a quick queue health read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDepthHistogram {
    #[serde(rename = "0")]
    pub zero: u64,
    #[serde(rename = "1-5")]
    pub low: u64,
    #[serde(rename = "6-20")]
    pub medium: u64,
    #[serde(rename = "21+")]
    pub high: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsResponse {
    pub uptime_sec: u64,
    pub counts: DiagnosticsCounts,
    pub queue_depth_histogram: QueueDepthHistogram,
    pub metrics: Option<HostMetrics>,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_bucket_names_on_the_wire() {
        let hist = QueueDepthHistogram { zero: 3, low: 2, medium: 1, high: 0 };
        let value = serde_json::to_value(&hist).unwrap();
        assert_eq!(value["0"], 3);
        assert_eq!(value["1-5"], 2);
        assert_eq!(value["6-20"], 1);
        assert_eq!(value["21+"], 0);
    }

    #[test]
    fn register_request_is_strict() {
        assert!(serde_json::from_str::<RegisterRequest>(r#"{"id":"alice"}"#).is_ok());
        assert!(serde_json::from_str::<RegisterRequest>(r#"{"id":"alice","admin":true}"#).is_err());
        assert!(serde_json::from_str::<RegisterRequest>(r#"{}"#).is_err());
    }
}
