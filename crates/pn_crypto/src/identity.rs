//! Identity key management
//!
//! Each identity has one long-term `IdentityKeyPair` (Ed25519) created at
//! store bootstrap and immutable thereafter. The Ed25519 key signs prekeys;
//! for the X3DH diffie-hellman operations it is converted to X25519.
//!
//! Peer identity keys are pinned trust-on-first-use. A later mismatch is
//! reported to callers as a key replacement; policy lives above this layer.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::{rngs::OsRng, Rng};
use zeroize::ZeroizeOnDrop;

use crate::codec;
use crate::error::CryptoError;

/// Registration ids are uniform in [1, 16380].
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// Generate a fresh registration id for a new identity.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=MAX_REGISTRATION_ID)
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity signing key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            secret: signing_key.to_bytes(),
        }
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity secret must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&secret);
        Ok(Self { public: signing_key.verifying_key().to_bytes(), secret })
    }

    pub fn public_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn public_b64(&self) -> String {
        codec::encode(&self.public)
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature against any Ed25519 public key.
    pub fn verify(public: &[u8; 32], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(public)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig.try_into()
                .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?,
        );
        vk.verify(msg, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

// ── Ed25519 ↔ X25519 conversion ───────────────────────────────────────────────

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// This uses the clamped SHA-512 expansion that ed25519-dalek uses
/// internally, mirroring libsignal's identity-key conversion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> x25519_dalek::StaticSecret {
    use sha2::{Digest, Sha512};
    use zeroize::Zeroize;
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    x25519_dalek::StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public
/// key via the birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<x25519_dalek::PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    Ok(x25519_dalek::PublicKey::from(point.to_montgomery().to_bytes()))
}
