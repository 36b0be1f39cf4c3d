//! Key derivation functions
//!
//! `store_key_from_passphrase` — scrypt, derives the 32-byte key used to
//!   seal every record in the local SQLite store.
//!
//! `hkdf_expand` — HKDF-SHA256, used for session key material.
//!
//! The scrypt cost parameters are written to the store's plaintext metadata
//! sidecar on first open and read back verbatim on every later open. They
//! are never mutated — reopening with the original passphrase must derive
//! the exact same key.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::codec::b64;
use crate::error::CryptoError;

// ── Store key (scrypt) ────────────────────────────────────────────────────────

/// 32-byte store key derived from the user passphrase. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct StoreKey(pub [u8; 32]);

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StoreKey").field(&"<redacted>").finish()
    }
}

/// Scrypt cost parameters, pinned in the store's plaintext sidecar.
///
/// Serialized shape: `{salt: base64, n: int, r: int, p: int, key_len: int}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub n: u32,
    pub r: u32,
    pub p: u32,
    pub key_len: u32,
}

impl KdfParams {
    /// Parameters for a freshly created store: N=16384, r=8, p=1,
    /// 32-byte key, 16 random salt bytes.
    pub fn fresh() -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self { salt, n: 16384, r: 8, p: 1, key_len: 32 }
    }
}

/// Derive the store key from a passphrase and pinned parameters.
///
/// Intentionally CPU-heavy and blocking — callers on an async runtime must
/// run this on a blocking worker.
pub fn store_key_from_passphrase(
    passphrase: &[u8],
    params: &KdfParams,
) -> Result<StoreKey, CryptoError> {
    if params.key_len != 32 {
        return Err(CryptoError::KeyDerivation(format!(
            "key_len must be 32, got {}",
            params.key_len
        )));
    }
    if !params.n.is_power_of_two() || params.n < 2 {
        return Err(CryptoError::KeyDerivation(format!(
            "scrypt cost n must be a power of two >= 2, got {}",
            params.n
        )));
    }
    let log_n = params.n.trailing_zeros() as u8;
    let scrypt_params = scrypt::Params::new(log_n, params.r, params.p, params.key_len as usize)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut output = [0u8; 32];
    scrypt::scrypt(passphrase, &params.salt, &scrypt_params, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(StoreKey(output))
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be empty (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}
