//! Relay persistence over SQLite via sqlx. WAL journal mode; writers
//! serialize at the database, which is what gives `send_message` its
//! per-recipient FIFO.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use pn_proto::api::QueueDepthHistogram;

use crate::error::RelayError;

pub async fn open(db_path: &Path) -> Result<SqlitePool, RelayError> {
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePool::connect_with(opts).await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| RelayError::Schema(format!("migration failed: {e}")))?;
    Ok(pool)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Users ────────────────────────────────────────────────────────────────────

/// Insert if absent; registering twice is a no-op.
pub async fn register_user(pool: &SqlitePool, id: &str) -> Result<(), RelayError> {
    sqlx::query("INSERT INTO users (id, created_at_ms) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
        .bind(id)
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn user_exists(pool: &SqlitePool, id: &str) -> Result<bool, RelayError> {
    let row: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

// ── Prekey bundles ───────────────────────────────────────────────────────────

/// Last write wins.
pub async fn upsert_bundle(pool: &SqlitePool, id: &str, bundle_json: &str) -> Result<(), RelayError> {
    sqlx::query(
        "INSERT INTO prekeys (id, bundle_json, updated_at_ms) VALUES (?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET bundle_json = excluded.bundle_json, updated_at_ms = excluded.updated_at_ms",
    )
    .bind(id)
    .bind(bundle_json)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_bundle(pool: &SqlitePool, id: &str) -> Result<Option<String>, RelayError> {
    let row: Option<String> = sqlx::query_scalar("SELECT bundle_json FROM prekeys WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

// ── Messages ─────────────────────────────────────────────────────────────────

pub struct QueuedMessage {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub envelope_json: String,
}

pub async fn insert_message(
    pool: &SqlitePool,
    msg_id: &str,
    from: &str,
    to: &str,
    envelope_json: &str,
) -> Result<(), RelayError> {
    sqlx::query(
        "INSERT INTO messages (id, to_id, from_id, envelope_json, created_at_ms, delivered)
         VALUES (?, ?, ?, ?, ?, 0)",
    )
    .bind(msg_id)
    .bind(to)
    .bind(from)
    .bind(envelope_json)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// Delivery flips the flag; rows are never deleted (queue history feeds the
/// diagnostics histogram).
pub async fn mark_delivered(pool: &SqlitePool, msg_id: &str) -> Result<(), RelayError> {
    sqlx::query("UPDATE messages SET delivered = 1 WHERE id = ?")
        .bind(msg_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Undelivered messages for one recipient, ingest order. rowid breaks
/// same-millisecond ties.
pub async fn pending_for(pool: &SqlitePool, to: &str) -> Result<Vec<QueuedMessage>, RelayError> {
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(
        "SELECT id, from_id, to_id, envelope_json FROM messages
         WHERE to_id = ? AND delivered = 0
         ORDER BY created_at_ms ASC, rowid ASC",
    )
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, from_id, to_id, envelope_json)| QueuedMessage { id, from_id, to_id, envelope_json })
        .collect())
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

pub async fn count_users(pool: &SqlitePool) -> Result<u64, RelayError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users").fetch_one(pool).await?;
    Ok(n as u64)
}

pub async fn count_prekeys(pool: &SqlitePool) -> Result<u64, RelayError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prekeys").fetch_one(pool).await?;
    Ok(n as u64)
}

pub async fn count_queued(pool: &SqlitePool) -> Result<u64, RelayError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE delivered = 0")
        .fetch_one(pool)
        .await?;
    Ok(n as u64)
}

/// Histogram of per-recipient undelivered counts over every registered
/// user. Buckets: 0, 1–5, 6–20, 21+.
pub async fn queue_depth_histogram(pool: &SqlitePool) -> Result<QueueDepthHistogram, RelayError> {
    let users = count_users(pool).await?;
    let depths: Vec<i64> = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE delivered = 0 GROUP BY to_id",
    )
    .fetch_all(pool)
    .await?;

    let mut hist = QueueDepthHistogram::default();
    for depth in &depths {
        match depth {
            1..=5 => hist.low += 1,
            6..=20 => hist.medium += 1,
            _ => hist.high += 1,
        }
    }
    hist.zero = users.saturating_sub(depths.len() as u64);
    Ok(hist)
}
