//! Shared relay state: the SQLite pool, the live-subscription map, and the
//! diagnostics sink.
//!
//! The subscription map is owned state with the relay's lifetime, never a
//! global. At most one entry per identity (invariant: a new subscription
//! displaces the old one with close code 4000 / "superseded").

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use pn_proto::api::Delivery;
use pn_proto::app::HostMetrics;

use crate::db;
use crate::error::RelayError;

/// Commands the request side sends into a live subscription task.
pub enum SubCommand {
    /// Push one frame; `ack` reports whether the socket write succeeded.
    Deliver { frame: Delivery, ack: oneshot::Sender<bool> },
    /// A newer subscription for the same identity took over.
    Supersede,
}

pub struct Subscriber {
    pub conn_id: u64,
    pub tx: mpsc::Sender<SubCommand>,
}

#[derive(Clone)]
pub struct RelayState {
    pub pool: sqlx::SqlitePool,
    pub subs: Arc<Mutex<HashMap<String, Subscriber>>>,
    pub metrics: Arc<RwLock<Option<HostMetrics>>>,
    started_at: Instant,
    conn_counter: Arc<AtomicU64>,
}

impl RelayState {
    pub async fn open(db_path: &Path) -> Result<Self, RelayError> {
        let pool = db::open(db_path).await?;
        Ok(Self {
            pool,
            subs: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(None)),
            started_at: Instant::now(),
            conn_counter: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a new subscription, displacing any previous one for the same
    /// identity. Returns the command receiver for the new subscription task.
    pub async fn subscribe(&self, client_id: &str, conn_id: u64) -> mpsc::Receiver<SubCommand> {
        let (tx, rx) = mpsc::channel(64);
        let displaced = {
            let mut subs = self.subs.lock().await;
            subs.insert(client_id.to_string(), Subscriber { conn_id, tx })
        };
        if let Some(old) = displaced {
            tracing::info!(client_id, old_conn = old.conn_id, "subscription superseded");
            let _ = old.tx.send(SubCommand::Supersede).await;
        }
        rx
    }

    /// Drop this connection's map entry, unless a successor already owns it.
    pub async fn unsubscribe(&self, client_id: &str, conn_id: u64) {
        let mut subs = self.subs.lock().await;
        if subs.get(client_id).is_some_and(|s| s.conn_id == conn_id) {
            subs.remove(client_id);
        }
    }

    /// Attempt an immediate push to a live subscription. Returns true only
    /// when the frame went out on the wire.
    pub async fn try_push(&self, frame: Delivery) -> bool {
        let tx = {
            let subs = self.subs.lock().await;
            match subs.get(&frame.to) {
                Some(sub) => sub.tx.clone(),
                None => return false,
            }
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(SubCommand::Deliver { frame, ack: ack_tx }).await.is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    pub async fn active_connections(&self) -> u64 {
        self.subs.lock().await.len() as u64
    }
}
