//! Authenticated key-value store over SQLite via sqlx.
//!
//! Two tables:
//!   meta — plaintext JSON values (KDF sidecar, local id, device,
//!          registration id). Nothing else is ever plaintext.
//!   kv   — every blob is `aead::seal(store_key, serde_json(record))`.
//!
//! Concurrency contract: mutating operations serialize behind a single
//! logical writer (the `writer` mutex guards read-modify-write sequences
//! such as counter allocation); plain readers run concurrently and see a
//! consistent WAL snapshot.

use std::path::Path;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use pn_crypto::{aead, kdf, CryptoError};

use crate::error::StoreError;

/// Sealed sentinel written at creation so a wrong passphrase fails fast at
/// open instead of on the first record read.
const CHECK_KEY: &str = "store:check";
const CHECK_PLAINTEXT: &[u8] = b"postern-store-check-v1";

/// Central store handle. Cheap to clone (Arc internally).
#[derive(Clone, Debug)]
pub struct Store {
    pub pool: SqlitePool,
    key: Arc<kdf::StoreKey>,
    writer: Arc<Mutex<()>>,
}

impl Store {
    /// Open (or create) the encrypted store at `db_path`.
    ///
    /// On a fresh file this writes the KDF sidecar and the check record; on
    /// an existing file it reads the sidecar back verbatim, derives the same
    /// key, and verifies it against the check record. The scrypt call is
    /// CPU-heavy and runs on a blocking worker.
    pub async fn open(db_path: &Path, passphrase: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        // KDF sidecar: pinned at creation, never mutated.
        let params = match Self::raw_meta_get(&pool, "kdf").await? {
            Some(json) => serde_json::from_str::<kdf::KdfParams>(&json)
                .map_err(|e| StoreError::BadKdfSidecar(e.to_string()))?,
            None => {
                let params = kdf::KdfParams::fresh();
                Self::raw_meta_set(&pool, "kdf", &serde_json::to_string(&params)?).await?;
                params
            }
        };

        let pass = passphrase.as_bytes().to_vec();
        let key = tokio::task::spawn_blocking(move || kdf::store_key_from_passphrase(&pass, &params))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))??;

        let store = Self {
            pool,
            key: Arc::new(key),
            writer: Arc::new(Mutex::new(())),
        };
        store.verify_passphrase().await?;
        debug!(path = %db_path.display(), "store open");
        Ok(store)
    }

    async fn verify_passphrase(&self) -> Result<(), StoreError> {
        match self.get_raw(CHECK_KEY).await? {
            Some(sealed) => {
                let opened =
                    aead::open(&self.key.0, &sealed).map_err(|_| StoreError::WrongPassphrase)?;
                if opened.as_slice() != CHECK_PLAINTEXT {
                    return Err(StoreError::WrongPassphrase);
                }
                Ok(())
            }
            None => {
                let sealed = aead::seal(&self.key.0, CHECK_PLAINTEXT)?;
                self.set_raw(CHECK_KEY, &sealed).await
            }
        }
    }

    /// Take the writer lock for a read-modify-write sequence (counter
    /// allocation, session rewrite). Plain single-key writes do not need it;
    /// SQLite serializes them.
    pub async fn write_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    // ── Encrypted kv ─────────────────────────────────────────────────────

    /// Read and decrypt a record. A tag mismatch here means the passphrase
    /// is wrong or the database was tampered with — non-recoverable.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key).await? {
            None => Ok(None),
            Some(sealed) => {
                let plaintext = aead::open(&self.key.0, &sealed).map_err(|e| match e {
                    CryptoError::AeadOpen => StoreError::WrongPassphrase,
                    other => StoreError::Crypto(other),
                })?;
                Ok(Some(serde_json::from_slice(&plaintext)?))
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = aead::seal(&self.key.0, &plaintext)?;
        self.set_raw(key, &sealed).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Keys starting with `prefix`, sorted. Key names are internal constants
    /// and never contain LIKE wildcards.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM kv WHERE key LIKE ? || '%' ORDER BY key")
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;
        Ok(keys)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<Vec<u8>> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn set_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Plaintext meta sidecar ───────────────────────────────────────────

    pub async fn meta_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match Self::raw_meta_get(&self.pool, key).await? {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    pub async fn meta_set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        Self::raw_meta_set(&self.pool, key, &serde_json::to_string(value)?).await
    }

    async fn raw_meta_get(pool: &SqlitePool, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    async fn raw_meta_set(pool: &SqlitePool, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
        Ok(())
    }
}
