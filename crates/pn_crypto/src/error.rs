use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("AEAD encryption failed")]
    AeadSeal,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadOpen,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("KEM operation failed: {0}")]
    Kem(String),

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Too many skipped messages ({got} > {max}) — message irrecoverably out of order")]
    TooManySkipped { got: u64, max: u64 },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
