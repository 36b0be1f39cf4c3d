//! pn_store — Encrypted per-identity storage and the message pipeline
//!
//! # Encryption strategy
//! SQLite does not natively encrypt. Postern uses application-level
//! encryption:
//! - Every `kv` blob is AES-256-GCM ciphertext under a key derived from the
//!   user passphrase via scrypt.
//! - The scrypt parameters live in the plaintext `meta` sidecar, pinned at
//!   store creation; the identity name, device id, and registration id are
//!   the only other plaintext rows.
//! - Secret material (identity keys, prekey secrets, KEM secrets, session
//!   state, peer identity pins) never touches disk unencrypted.
//!
//! # Module layout
//! - `kv`        — the SQL-backed encrypted key-value store
//! - `stores`    — typed sub-store views (identity, sessions, prekeys)
//! - `lifecycle` — identity bootstrap, prekey minting, bundles, session init
//! - `pipeline`  — envelope encrypt/decrypt on top of the stores
//! - `error`     — unified error type

pub mod error;
pub mod kv;
pub mod lifecycle;
pub mod pipeline;
pub mod stores;

pub use error::StoreError;
pub use kv::Store;
