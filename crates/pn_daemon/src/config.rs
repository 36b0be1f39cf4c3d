//! Daemon configuration. Every option can come from the command line or the
//! environment; the passphrase is required and is never logged.

use std::fmt;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Clone)]
#[command(name = "pn-daemon", version, about = "Postern protocol daemon")]
pub struct DaemonConfig {
    /// Relay to send requests to and open the subscription against.
    #[arg(long, env = "PN_RELAY_URL", default_value = "http://127.0.0.1:8470")]
    pub relay_base_url: String,

    /// Path to this identity's encrypted store file.
    #[arg(long, env = "PN_STORE_PATH")]
    pub store_path: PathBuf,

    /// Secret used with the store's KDF sidecar.
    #[arg(long, env = "PN_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,

    /// Identity name.
    #[arg(long, env = "PN_LOCAL_ID", default_value = "agent")]
    pub local_id: String,

    /// Default recipient, where applicable.
    #[arg(long, env = "PN_PEER_ID")]
    pub peer_id: Option<String>,

    /// Publish cadence for telemetry-producing roles.
    #[arg(long, env = "PN_INTERVAL_MS")]
    pub interval_ms: Option<u64>,

    /// Request-reply deadline for the synchronous chat path.
    #[arg(long, env = "PN_CHAT_TIMEOUT_MS", default_value_t = 25_000)]
    pub chat_timeout_ms: u64,
}

impl DaemonConfig {
    /// The relay's WebSocket endpoint for this configuration.
    pub fn ws_url(&self, client_id: &str) -> String {
        let base = self
            .relay_base_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!("{}/ws?client_id={client_id}", base.trim_end_matches('/'))
    }
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("relay_base_url", &self.relay_base_url)
            .field("store_path", &self.store_path)
            .field("passphrase", &"<redacted>")
            .field("local_id", &self.local_id)
            .field("peer_id", &self.peer_id)
            .field("interval_ms", &self.interval_ms)
            .field("chat_timeout_ms", &self.chat_timeout_ms)
            .finish()
    }
}
