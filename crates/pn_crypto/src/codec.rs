//! Binary↔text coding helpers.
//!
//! Records that land in the encrypted store carry raw public keys and
//! signatures. JSON has no native byte-array type, so `Blob` serializes as
//! a tagged object:
//!
//!   { "__type": "ab", "data": "<base64>" }
//!
//! which round-trips losslessly through nested structures. Plain base64
//! string fields (wire APIs, the KDF sidecar) use the `b64` serde module.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

/// Encode bytes for a wire or sidecar field.
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a wire or sidecar field.
pub fn decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)
}

/// Decode a field that must be exactly 32 bytes (curve keys).
pub fn decode_32(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = decode(s)?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

// ── Tagged byte arrays ────────────────────────────────────────────────────────

/// Raw bytes inside a stored record. Serializes as `{"__type":"ab","data":…}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

#[derive(Serialize)]
struct TaggedRef<'a> {
    #[serde(rename = "__type")]
    kind: &'static str,
    data: &'a str,
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "__type")]
    kind: String,
    data: String,
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = encode(&self.0);
        TaggedRef { kind: "ab", data: &data }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tagged = Tagged::deserialize(deserializer)?;
        if tagged.kind != "ab" {
            return Err(serde::de::Error::custom(format!(
                "expected byte-array tag \"ab\", got {:?}",
                tagged.kind
            )));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(&tagged.data)
            .map_err(serde::de::Error::custom)?;
        Ok(Blob(bytes))
    }
}

// ── Plain base64 string fields ────────────────────────────────────────────────

pub mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)
    }
}

// ── Constant-time compare ─────────────────────────────────────────────────────

/// Timing-safe equality for key material. Lengths are public; the content
/// comparison never short-circuits.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Record {
        name: String,
        key: Blob,
        nested: Inner,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Inner {
        sig: Blob,
    }

    #[test]
    fn blob_roundtrips_inside_nested_structures() {
        let record = Record {
            name: "alice".into(),
            key: Blob(vec![0, 1, 2, 255]),
            nested: Inner { sig: Blob(vec![9u8; 64]) },
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"__type\":\"ab\""));
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn blob_rejects_wrong_tag() {
        let err = serde_json::from_str::<Blob>(r#"{"__type":"buf","data":"AAEC"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn ct_eq_basics() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"diff"));
        assert!(!ct_eq(b"short", b"longer"));
        assert!(ct_eq(b"", b""));
    }
}
