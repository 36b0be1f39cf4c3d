//! The daemon shell: store bootstrap, relay subscription with bounded
//! backoff, inbound dispatch, and serialized outbound sends.
//!
//! Concurrency rules enforced here:
//! - per-peer mutexes guard the session read-modify-write critical section
//!   (encrypt and decrypt for the same peer never interleave)
//! - a single global gate serializes chat prompts across ALL peers, which
//!   keeps application-layer replies from reordering
//! - transport failures reconnect with backoff; a `send` is never retried
//!   automatically (application-layer ids are the dedup handles)

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pn_proto::api::{Delivery, SendMessageResponse};
use pn_proto::app::AppMessage;
use pn_store::{lifecycle, pipeline, Store};

use crate::client::RelayClient;
use crate::config::DaemonConfig;
use crate::error::DaemonError;

/// Prekeys minted per boot; each boot also rotates the signed and KEM
/// prekeys and republishes the bundle.
const PREKEY_BATCH: u32 = 16;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default collection window for the short-poll receive variant.
pub const DEFAULT_POLL_WINDOW: Duration = Duration::from_millis(900);

/// A decrypted, decoded inbound message.
#[derive(Debug)]
pub struct Inbound {
    pub from: String,
    pub message: AppMessage,
}

pub struct Daemon {
    config: DaemonConfig,
    local_id: String,
    store: Store,
    client: RelayClient,
    peer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    prompt_gate: Mutex<()>,
}

impl Daemon {
    /// Open the store (bootstrapping the identity if new), mint a prekey
    /// batch, and register + publish the bundle at the relay.
    pub async fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        if config.passphrase.is_empty() {
            return Err(DaemonError::Config("passphrase must not be empty".into()));
        }

        let store = Store::open(&config.store_path, &config.passphrase).await?;
        let local = match lifecycle::local_identity(&store).await? {
            Some(local) => {
                if local.name != config.local_id {
                    return Err(DaemonError::Config(format!(
                        "store belongs to {:?}, configured local_id is {:?}",
                        local.name, config.local_id
                    )));
                }
                local
            }
            None => lifecycle::bootstrap_identity(&store, &config.local_id, 1).await?,
        };

        lifecycle::mint_prekeys(&store, PREKEY_BATCH).await?;

        let client = RelayClient::new(&config.relay_base_url);
        client.register(&local.name).await?;
        let bundle = lifecycle::export_bundle(&store).await?;
        client.upload_bundle(&local.name, &bundle).await?;

        info!(local_id = %local.name, relay = %config.relay_base_url, "daemon started");
        Ok(Self {
            local_id: local.name,
            config,
            store,
            client,
            peer_locks: Mutex::new(HashMap::new()),
            prompt_gate: Mutex::new(()),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    async fn peer_lock(&self, peer: &str) -> Arc<Mutex<()>> {
        let mut locks = self.peer_locks.lock().await;
        locks.entry(peer.to_string()).or_default().clone()
    }

    /// Establish a session with `peer` if none exists yet, fetching its
    /// bundle from the relay.
    pub async fn ensure_session(&self, peer: &str) -> Result<(), DaemonError> {
        use pn_store::stores::SessionStore;
        if self.store.sessions().has_session(peer, pipeline::DEFAULT_DEVICE).await? {
            return Ok(());
        }
        let bundle = self.client.fetch_bundle(peer).await?;
        let init = lifecycle::init_session_from_bundle(&self.store, &bundle).await?;
        if init.identity_replaced {
            warn!(peer, "peer identity key changed since last contact");
        }
        Ok(())
    }

    /// Encrypt and post one application message to `peer`.
    pub async fn send(
        &self,
        peer: &str,
        message: &AppMessage,
    ) -> Result<SendMessageResponse, DaemonError> {
        let lock = self.peer_lock(peer).await;
        let _guard = lock.lock().await;
        self.ensure_session(peer).await?;
        let envelope = pipeline::encrypt(&self.store, peer, &message.encode()?).await?;
        self.client.send_message(&self.local_id, peer, envelope).await
    }

    /// Synchronous chat path: send a prompt, wait for the correlated reply.
    ///
    /// The subscription opens BEFORE the prompt is posted so the reply
    /// cannot race past us. Prompts across all peers serialize behind one
    /// gate. An absent reply within `chat_timeout_ms` is a timeout; a relay
    /// stream that ends first is `StreamClosedBeforeReply`.
    pub async fn send_chat_prompt(&self, peer: &str, prompt: &str) -> Result<String, DaemonError> {
        let _gate = self.prompt_gate.lock().await;

        let request_id = Uuid::new_v4().to_string();
        let message = AppMessage::ChatPrompt {
            request_id: request_id.clone(),
            prompt: prompt.to_string(),
            from: self.local_id.clone(),
            created_at: Utc::now(),
        };

        let (mut ws, _) = connect_async(self.config.ws_url(&self.local_id)).await?;
        self.send(peer, &message).await?;

        let deadline = Duration::from_millis(self.config.chat_timeout_ms);
        let result = timeout(deadline, async {
            loop {
                let Some(frame) = ws.next().await else {
                    return Err(DaemonError::StreamClosedBeforeReply);
                };
                match frame? {
                    WsMessage::Text(text) => {
                        let Ok(delivery) = serde_json::from_str::<Delivery>(text.as_str()) else {
                            continue;
                        };
                        match self.decode_frame(delivery).await {
                            Ok(Inbound {
                                message: AppMessage::ChatReply { request_id: rid, reply, .. },
                                ..
                            }) if rid == request_id => return Ok(reply),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "inbound envelope rejected"),
                        }
                    }
                    WsMessage::Close(_) => return Err(DaemonError::StreamClosedBeforeReply),
                    _ => {}
                }
            }
        })
        .await;

        let _ = ws.close(None).await;
        match result {
            Ok(reply) => reply,
            Err(_) => Err(DaemonError::TimeoutWaitingForReply),
        }
    }

    /// Short-poll receive: hold a subscription for `window`, collect every
    /// decoded message matching `predicate`, close, return.
    pub async fn recv_matching<F>(
        &self,
        window: Duration,
        mut predicate: F,
    ) -> Result<Vec<Inbound>, DaemonError>
    where
        F: FnMut(&Inbound) -> bool,
    {
        let (mut ws, _) = connect_async(self.config.ws_url(&self.local_id)).await?;
        let deadline = tokio::time::Instant::now() + window;
        let mut collected = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, ws.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(frame)) => match frame? {
                    WsMessage::Text(text) => {
                        let Ok(delivery) = serde_json::from_str::<Delivery>(text.as_str()) else {
                            continue;
                        };
                        match self.decode_frame(delivery).await {
                            Ok(inbound) => {
                                if predicate(&inbound) {
                                    collected.push(inbound);
                                }
                            }
                            Err(e) => warn!(error = %e, "inbound envelope rejected"),
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                },
            }
        }

        let _ = ws.close(None).await;
        Ok(collected)
    }

    /// Long-running receive loop: keep a subscription open, reconnect on any
    /// close with bounded backoff, and hand every decoded inbound message to
    /// `events`. Returns when `shutdown` resolves or the receiver is gone.
    pub async fn run(
        &self,
        events: mpsc::Sender<Inbound>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), DaemonError> {
        tokio::pin!(shutdown);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("daemon shutting down");
                    return Ok(());
                }
                result = self.run_subscription(&events) => match result {
                    Ok(ReceiverGone) => return Ok(()),
                    Ok(StreamEnded) => {
                        backoff = INITIAL_BACKOFF;
                        debug!("subscription closed; reconnecting");
                    }
                    Err(e) => {
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "subscription failed; reconnecting");
                    }
                },
            }

            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn run_subscription(
        &self,
        events: &mpsc::Sender<Inbound>,
    ) -> Result<SubscriptionEnd, DaemonError> {
        let (mut ws, _) = connect_async(self.config.ws_url(&self.local_id)).await?;
        debug!(local_id = %self.local_id, "subscription open");

        while let Some(frame) = ws.next().await {
            match frame? {
                WsMessage::Text(text) => {
                    let delivery: Delivery = match serde_json::from_str(text.as_str()) {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            warn!(error = %e, "unparseable delivery frame");
                            continue;
                        }
                    };
                    match self.decode_frame(delivery).await {
                        Ok(inbound) => {
                            if events.send(inbound).await.is_err() {
                                return Ok(ReceiverGone);
                            }
                        }
                        Err(e) => warn!(error = %e, "inbound envelope rejected"),
                    }
                }
                WsMessage::Close(frame) => {
                    debug!(?frame, "subscription closed by relay");
                    return Ok(StreamEnded);
                }
                _ => {}
            }
        }
        Ok(StreamEnded)
    }

    /// Validate → decrypt → decode, holding the sender's session lock.
    async fn decode_frame(&self, delivery: Delivery) -> Result<Inbound, DaemonError> {
        delivery.envelope.validate()?;
        let lock = self.peer_lock(&delivery.envelope.sender).await;
        let _guard = lock.lock().await;
        let plaintext = pipeline::decrypt(&self.store, &delivery.envelope).await?;
        let message = AppMessage::decode(&plaintext)?;
        Ok(Inbound { from: delivery.from, message })
    }
}

use SubscriptionEnd::{ReceiverGone, StreamEnded};

enum SubscriptionEnd {
    /// The relay (or network) ended the stream; reconnect.
    StreamEnded,
    /// The event receiver was dropped; the daemon is done.
    ReceiverGone,
}
