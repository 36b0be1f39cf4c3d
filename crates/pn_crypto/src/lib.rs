//! pn_crypto — Postern cryptographic primitives and protocol state machines
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Key material crosses API boundaries as opaque newtypes or raw 32-byte
//!   arrays, never as printable strings.
//!
//! # Module layout
//! - `kdf`       — scrypt passphrase derivation (store key) + HKDF expansion
//! - `aead`      — AES-256-GCM seal/open (`iv ‖ tag ‖ ct` wire order)
//! - `codec`     — tagged byte-array JSON encoding, base64 helpers, constant-time compare
//! - `identity`  — long-term Ed25519 identity keys, registration ids
//! - `kem`       — ML-KEM-768 keypairs, encapsulation, decapsulation
//! - `handshake` — X3DH + KEM asynchronous key agreement over prekey bundles
//! - `ratchet`   — double ratchet session state (DH steps, skipped keys)
//! - `error`     — unified error type

pub mod aead;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod kdf;
pub mod kem;
pub mod ratchet;

pub use error::CryptoError;
