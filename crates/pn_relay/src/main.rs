use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pn_relay::{app, RelayState};

/// Postern relay — store-and-forward router for encrypted envelopes.
#[derive(Parser, Debug)]
#[command(name = "pn-relay", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "PN_RELAY_BIND", default_value = "127.0.0.1:8470")]
    bind: SocketAddr,

    /// Path to the relay's SQLite database.
    #[arg(long, env = "PN_RELAY_DB", default_value = "pn-relay.db")]
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let state = RelayState::open(&args.db_path)
        .await
        .with_context(|| format!("opening relay store at {}", args.db_path.display()))?;

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(bind = %args.bind, db = %args.db_path.display(), "relay listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
