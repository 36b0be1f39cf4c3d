use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Wrong passphrase or corrupted store")]
    WrongPassphrase,

    #[error("KDF sidecar is unparseable: {0}")]
    BadKdfSidecar(String),

    #[error("Store already has an identity")]
    IdentityExists,

    #[error("Store has no identity — bootstrap first")]
    NoIdentity,

    #[error("Bundle incomplete: no {0} has been minted")]
    BundleIncomplete(&'static str),

    #[error("Bundle unauthentic: prekey signatures do not verify against the bundle identity")]
    BundleUnauthentic,

    #[error("Session not established with {0}")]
    SessionNotEstablished(String),

    #[error("No session exists for {0}")]
    NoSession(String),

    #[error("Session setup failed: {0}")]
    SessionSetupFailed(String),

    #[error("Identity mismatch for {0}: pinned key differs from the presented key")]
    IdentityMismatch(String),

    #[error("Integrity failed: ciphertext does not authenticate")]
    IntegrityFailed,

    #[error("Message irrecoverably out of order")]
    OutOfOrderIrrecoverable,

    #[error("Crypto error: {0}")]
    Crypto(#[from] pn_crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Proto(#[from] pn_proto::ProtoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Blocking(String),
}
