use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use pn_daemon::{Daemon, DaemonConfig, Inbound};
use pn_proto::app::AppMessage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = DaemonConfig::parse();
    tracing::info!(?config, "starting daemon");

    let daemon = Daemon::start(config).await?;
    let (events_tx, mut events_rx) = mpsc::channel::<Inbound>(64);

    // The application handler is supplied by the embedding satellite; the
    // bare shell just logs what arrives.
    let consumer = tokio::spawn(async move {
        while let Some(inbound) = events_rx.recv().await {
            match &inbound.message {
                AppMessage::ChatPrompt { request_id, from, .. } => {
                    tracing::info!(%from, %request_id, "chat prompt received");
                }
                AppMessage::ChatReply { request_id, from, .. } => {
                    tracing::info!(%from, %request_id, "chat reply received");
                }
                AppMessage::TelemetryReport { source, report_id, .. } => {
                    tracing::info!(%source, %report_id, "telemetry report received");
                }
                AppMessage::ControlPing { created_at } => {
                    tracing::info!(%created_at, from = %inbound.from, "ping received");
                }
            }
        }
    });

    daemon
        .run(events_tx, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    consumer.abort();
    Ok(())
}
