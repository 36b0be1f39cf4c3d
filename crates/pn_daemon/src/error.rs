use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] pn_store::StoreError),

    #[error("Protocol error: {0}")]
    Proto(#[from] pn_proto::ProtoError),

    #[error("Relay transport error: {0}")]
    Transport(String),

    #[error("Relay rejected the request ({status}): {kind}")]
    Relay { status: u16, kind: String },

    #[error("Timeout waiting for reply")]
    TimeoutWaitingForReply,

    #[error("Stream closed before reply")]
    StreamClosedBeforeReply,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DaemonError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DaemonError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
