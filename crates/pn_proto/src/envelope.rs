//! Encrypted message envelope — what the relay sees.
//!
//! The relay is a DUMB router: it reads sender, recipient, type, and
//! timestamp for routing and queueing, and nothing else. The body is an
//! opaque base64 blob whose inner shape depends on `type`:
//!
//!   initial    — handshake header + ratchet header + ciphertext
//!               (sent until the peer's first reply proves the handshake)
//!   subsequent — ratchet header + ciphertext
//!
//! Validation is strict on both ends; a malformed envelope never reaches
//! the decrypt pipeline or the relay's queue.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use pn_crypto::handshake::HandshakeHeader;
use pn_crypto::ratchet::RatchetHeader;

use crate::error::ProtoError;

pub const ENVELOPE_VERSION: u8 = 1;

/// The two wire forms of a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    /// Carries the prekey references that bootstrap the session.
    Initial,
    /// Ordinary ratchet message on an established session.
    Subsequent,
}

/// On-wire envelope — sent to and received from the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub version: u8,
    pub sender: String,
    pub recipient: String,
    /// Always `"{sender}::{recipient}"`.
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Base64 ciphertext payload (InitialPayload or SubsequentPayload JSON).
    pub body: String,
    pub timestamp_ms: u64,
}

impl Envelope {
    pub fn new(sender: &str, recipient: &str, kind: EnvelopeType, body: &[u8]) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            session_id: format!("{sender}::{recipient}"),
            kind,
            body: URL_SAFE_NO_PAD.encode(body),
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Strict validation; every field checked before the envelope is
    /// queued, pushed, or decrypted.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.version != ENVELOPE_VERSION {
            return Err(ProtoError::InvalidEnvelope(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.sender.is_empty() || self.recipient.is_empty() {
            return Err(ProtoError::InvalidEnvelope("empty sender or recipient".into()));
        }
        let expected = format!("{}::{}", self.sender, self.recipient);
        if self.session_id != expected {
            return Err(ProtoError::InvalidEnvelope(format!(
                "session_id {:?} does not match {:?}",
                self.session_id, expected
            )));
        }
        if self.body.is_empty() {
            return Err(ProtoError::InvalidEnvelope("empty body".into()));
        }
        URL_SAFE_NO_PAD
            .decode(&self.body)
            .map_err(|e| ProtoError::InvalidEnvelope(format!("body is not base64: {e}")))?;
        if self.timestamp_ms == 0 {
            return Err(ProtoError::InvalidEnvelope("timestamp_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn body_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.body)?)
    }
}

// ── Ciphertext body forms ────────────────────────────────────────────────────

/// Body of an `initial` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialPayload {
    pub handshake: HandshakeHeader,
    pub ratchet: RatchetHeader,
    /// AEAD ciphertext (base64).
    pub ciphertext: String,
}

/// Body of a `subsequent` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsequentPayload {
    pub ratchet: RatchetHeader,
    /// AEAD ciphertext (base64).
    pub ciphertext: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new("bob", "alice", EnvelopeType::Initial, b"ciphertext bytes")
    }

    #[test]
    fn fresh_envelope_validates() {
        let env = sample();
        env.validate().unwrap();
        assert_eq!(env.session_id, "bob::alice");
        assert_eq!(env.body_bytes().unwrap(), b"ciphertext bytes");
    }

    #[test]
    fn rejects_wrong_version() {
        let mut env = sample();
        env.version = 2;
        assert!(env.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_session_id() {
        let mut env = sample();
        env.session_id = "alice::bob".into();
        assert!(env.validate().is_err());
    }

    #[test]
    fn rejects_empty_or_invalid_body() {
        let mut env = sample();
        env.body = String::new();
        assert!(env.validate().is_err());

        let mut env = sample();
        env.body = "not base64 !!!".into();
        assert!(env.validate().is_err());
    }

    #[test]
    fn rejects_zero_timestamp() {
        let mut env = sample();
        env.timestamp_ms = 0;
        assert!(env.validate().is_err());
    }

    #[test]
    fn rejects_unknown_type_on_decode() {
        let json = serde_json::json!({
            "version": 1,
            "sender": "bob",
            "recipient": "alice",
            "session_id": "bob::alice",
            "type": "mystery",
            "body": "AAAA",
            "timestamp_ms": 1,
        });
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = serde_json::json!({
            "version": 1,
            "sender": "bob",
            "recipient": "alice",
            "session_id": "bob::alice",
            "type": "subsequent",
            "body": "AAAA",
            "timestamp_ms": 1,
            "extra": true,
        });
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }
}
