//! Application message types (inside the encrypted envelope).
//!
//! A `kind`-discriminated union; unknown kinds fail decoding. These shapes
//! are the dedup handles across relay reconnects: `request_id`,
//! `report_id`, and `created_at` identify a logical message regardless of
//! how many times its envelope is delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;

/// Plaintext application message carried inside an envelope body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", deny_unknown_fields)]
pub enum AppMessage {
    /// A prompt addressed to the chat agent.
    #[serde(rename = "chat.prompt")]
    ChatPrompt {
        /// UUID v4; the reply echoes the same value.
        request_id: String,
        prompt: String,
        from: String,
        created_at: DateTime<Utc>,
    },

    /// The agent's reply, correlated by `request_id`.
    #[serde(rename = "chat.reply")]
    ChatReply {
        request_id: String,
        reply: String,
        from: String,
        created_at: DateTime<Utc>,
    },

    /// Periodic probe report: a relay diagnostics snapshot plus host metrics.
    #[serde(rename = "telemetry.report")]
    TelemetryReport {
        report_id: String,
        source: String,
        relay_snapshot: serde_json::Value,
        host_metrics: HostMetrics,
        created_at: DateTime<Utc>,
    },

    /// Liveness check; no payload beyond the timestamp.
    #[serde(rename = "control.ping")]
    ControlPing { created_at: DateTime<Utc> },
}

impl AppMessage {
    pub fn chat_prompt(from: &str, prompt: &str) -> Self {
        Self::ChatPrompt {
            request_id: Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            from: from.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn chat_reply(request_id: &str, from: &str, reply: &str) -> Self {
        Self::ChatReply {
            request_id: request_id.to_string(),
            reply: reply.to_string(),
            from: from.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn ping() -> Self {
        Self::ControlPing { created_at: Utc::now() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Host metrics snapshot produced by the telemetry probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMetrics {
    pub hostname: String,
    pub platform: String,
    pub cpu_load_pct: f64,
    pub mem_used_mb: f64,
    pub mem_total_mb: f64,
    pub uptime_sec: u64,
    pub collected_at: DateTime<Utc>,
}
