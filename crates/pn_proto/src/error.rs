use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
