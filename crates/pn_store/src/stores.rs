//! Typed sub-stores: facades over the encrypted KV with a fixed key layout.
//!
//! | facade          | keys                                        |
//! |-----------------|---------------------------------------------|
//! | identity        | `local:identityKeyPair`, `identity:{peer}.{device}` |
//! | session         | `session:{peer}.{device}`                   |
//! | one-time prekey | `prekey:{id}`, `prekey:used:{id}`           |
//! | signed prekey   | `signedprekey:{id}`                         |
//! | KEM prekey      | `kyberprekey:{id}`, `kyberprekey:used:{id}` |
//!
//! Counters live under `counter:prekey`, `counter:signedprekey`,
//! `counter:kyberprekey`; reading returns the next id to allocate.
//!
//! The views borrow the shared `Store` handle — they are not independent
//! owners, which keeps the single-writer discipline intact. The crypto
//! pipeline consumes them through the traits below.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use pn_crypto::codec::{ct_eq, Blob};
use pn_crypto::identity::IdentityKeyPair;
use pn_crypto::ratchet::RatchetState;

use crate::error::StoreError;
use crate::kv::Store;

pub const LOCAL_IDENTITY_KEY: &str = "local:identityKeyPair";

pub fn identity_key(peer: &str, device: u32) -> String {
    format!("identity:{peer}.{device}")
}

pub fn session_key(peer: &str, device: u32) -> String {
    format!("session:{peer}.{device}")
}

// ── Stored records ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredIdentityKeyPair {
    pub public: Blob,
    pub secret: Blob,
}

impl StoredIdentityKeyPair {
    pub fn keypair(&self) -> Result<IdentityKeyPair, StoreError> {
        Ok(IdentityKeyPair::from_bytes(self.secret.as_slice())?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: u32,
    pub public: Blob,
    pub secret: Blob,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub created_at_ms: u64,
    pub public: Blob,
    pub secret: Blob,
    /// Identity signature over the raw public bytes.
    pub signature: Blob,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KemPreKeyRecord {
    pub id: u32,
    pub created_at_ms: u64,
    pub public: Blob,
    pub secret: Blob,
    pub signature: Blob,
}

/// Consumption marker for one-time and KEM prekeys. The record itself stays
/// in place, which keeps consumption idempotent under replay.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsumptionMarker {
    pub used_at_ms: u64,
}

/// Trust-on-first-use pin for a peer identity key.
#[derive(Debug, Serialize, Deserialize)]
pub struct PinnedIdentity {
    pub public: Blob,
    pub pinned_at_ms: u64,
}

/// Outcome of comparing a presented peer key against the pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    FirstUse,
    Unchanged,
    Replaced,
}

// ── Counters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum PreKeyKind {
    OneTime,
    Signed,
    Kem,
}

impl PreKeyKind {
    fn counter_key(self) -> &'static str {
        match self {
            Self::OneTime => "counter:prekey",
            Self::Signed => "counter:signedprekey",
            Self::Kem => "counter:kyberprekey",
        }
    }
}

impl Store {
    /// Next id that WILL be allocated for `kind` (ids start at 1).
    pub async fn peek_counter(&self, kind: PreKeyKind) -> Result<u32, StoreError> {
        Ok(self.get::<u32>(kind.counter_key()).await?.unwrap_or(1))
    }

    /// Allocate `n` consecutive ids. Read-then-increment-and-write,
    /// serialized by the store's writer lock.
    pub async fn allocate_ids(&self, kind: PreKeyKind, n: u32) -> Result<Vec<u32>, StoreError> {
        let _guard = self.write_lock().await;
        let next = self.get::<u32>(kind.counter_key()).await?.unwrap_or(1);
        self.set(kind.counter_key(), &(next + n)).await?;
        Ok((next..next + n).collect())
    }
}

// ── Sub-store traits ─────────────────────────────────────────────────────────

pub trait IdentityStore {
    async fn load_local(&self) -> Result<Option<StoredIdentityKeyPair>, StoreError>;
    async fn store_local(&self, record: &StoredIdentityKeyPair) -> Result<(), StoreError>;
    async fn pinned(&self, peer: &str, device: u32) -> Result<Option<PinnedIdentity>, StoreError>;
    /// Trust-on-first-use: pin on first contact, report a later mismatch.
    /// The pin is rewritten on `Replaced` — policy lives with the caller.
    async fn pin(&self, peer: &str, device: u32, public: &[u8]) -> Result<PinOutcome, StoreError>;
}

pub trait SessionStore {
    async fn load_session(&self, peer: &str, device: u32)
        -> Result<Option<RatchetState>, StoreError>;
    async fn store_session(&self, state: &RatchetState) -> Result<(), StoreError>;
    async fn has_session(&self, peer: &str, device: u32) -> Result<bool, StoreError>;
}

pub trait PreKeyStore {
    async fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError>;
    async fn store_prekey(&self, record: &PreKeyRecord) -> Result<(), StoreError>;
    async fn mark_prekey_used(&self, id: u32) -> Result<(), StoreError>;
    async fn prekey_used(&self, id: u32) -> Result<bool, StoreError>;
}

pub trait SignedPreKeyStore {
    async fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError>;
    async fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), StoreError>;
}

pub trait KemPreKeyStore {
    async fn load_kem_prekey(&self, id: u32) -> Result<Option<KemPreKeyRecord>, StoreError>;
    async fn store_kem_prekey(&self, record: &KemPreKeyRecord) -> Result<(), StoreError>;
    async fn mark_kem_prekey_used(&self, id: u32) -> Result<(), StoreError>;
}

// ── Views ────────────────────────────────────────────────────────────────────

pub struct IdentityView<'s>(pub &'s Store);
pub struct SessionView<'s>(pub &'s Store);
pub struct PreKeyView<'s>(pub &'s Store);
pub struct SignedPreKeyView<'s>(pub &'s Store);
pub struct KemPreKeyView<'s>(pub &'s Store);

impl Store {
    pub fn identities(&self) -> IdentityView<'_> {
        IdentityView(self)
    }
    pub fn sessions(&self) -> SessionView<'_> {
        SessionView(self)
    }
    pub fn prekeys(&self) -> PreKeyView<'_> {
        PreKeyView(self)
    }
    pub fn signed_prekeys(&self) -> SignedPreKeyView<'_> {
        SignedPreKeyView(self)
    }
    pub fn kem_prekeys(&self) -> KemPreKeyView<'_> {
        KemPreKeyView(self)
    }
}

impl IdentityStore for IdentityView<'_> {
    async fn load_local(&self) -> Result<Option<StoredIdentityKeyPair>, StoreError> {
        self.0.get(LOCAL_IDENTITY_KEY).await
    }

    async fn store_local(&self, record: &StoredIdentityKeyPair) -> Result<(), StoreError> {
        self.0.set(LOCAL_IDENTITY_KEY, record).await
    }

    async fn pinned(&self, peer: &str, device: u32) -> Result<Option<PinnedIdentity>, StoreError> {
        self.0.get(&identity_key(peer, device)).await
    }

    async fn pin(&self, peer: &str, device: u32, public: &[u8]) -> Result<PinOutcome, StoreError> {
        let key = identity_key(peer, device);
        let outcome = match self.0.get::<PinnedIdentity>(&key).await? {
            None => PinOutcome::FirstUse,
            Some(existing) if ct_eq(existing.public.as_slice(), public) => {
                return Ok(PinOutcome::Unchanged)
            }
            Some(_) => PinOutcome::Replaced,
        };
        let pin = PinnedIdentity {
            public: Blob::from(public),
            pinned_at_ms: Utc::now().timestamp_millis() as u64,
        };
        self.0.set(&key, &pin).await?;
        Ok(outcome)
    }
}

impl SessionStore for SessionView<'_> {
    async fn load_session(
        &self,
        peer: &str,
        device: u32,
    ) -> Result<Option<RatchetState>, StoreError> {
        self.0.get(&session_key(peer, device)).await
    }

    async fn store_session(&self, state: &RatchetState) -> Result<(), StoreError> {
        self.0.set(&session_key(&state.peer, state.device), state).await
    }

    async fn has_session(&self, peer: &str, device: u32) -> Result<bool, StoreError> {
        Ok(self.load_session(peer, device).await?.is_some())
    }
}

impl PreKeyStore for PreKeyView<'_> {
    async fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        self.0.get(&format!("prekey:{id}")).await
    }

    async fn store_prekey(&self, record: &PreKeyRecord) -> Result<(), StoreError> {
        self.0.set(&format!("prekey:{}", record.id), record).await
    }

    async fn mark_prekey_used(&self, id: u32) -> Result<(), StoreError> {
        let marker = ConsumptionMarker { used_at_ms: Utc::now().timestamp_millis() as u64 };
        self.0.set(&format!("prekey:used:{id}"), &marker).await
    }

    async fn prekey_used(&self, id: u32) -> Result<bool, StoreError> {
        Ok(self.0.get::<ConsumptionMarker>(&format!("prekey:used:{id}")).await?.is_some())
    }
}

impl SignedPreKeyStore for SignedPreKeyView<'_> {
    async fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.0.get(&format!("signedprekey:{id}")).await
    }

    async fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), StoreError> {
        self.0.set(&format!("signedprekey:{}", record.id), record).await
    }
}

impl KemPreKeyStore for KemPreKeyView<'_> {
    async fn load_kem_prekey(&self, id: u32) -> Result<Option<KemPreKeyRecord>, StoreError> {
        self.0.get(&format!("kyberprekey:{id}")).await
    }

    async fn store_kem_prekey(&self, record: &KemPreKeyRecord) -> Result<(), StoreError> {
        self.0.set(&format!("kyberprekey:{}", record.id), record).await
    }

    async fn mark_kem_prekey_used(&self, id: u32) -> Result<(), StoreError> {
        let marker = ConsumptionMarker { used_at_ms: Utc::now().timestamp_millis() as u64 };
        self.0.set(&format!("kyberprekey:used:{id}"), &marker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp(dir: &TempDir) -> Store {
        Store::open(&dir.path().join("store.db"), "alpha").await.unwrap()
    }

    #[tokio::test]
    async fn counters_are_monotonic_without_gaps() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        assert_eq!(store.peek_counter(PreKeyKind::OneTime).await.unwrap(), 1);
        let first = store.allocate_ids(PreKeyKind::OneTime, 3).await.unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        let second = store.allocate_ids(PreKeyKind::OneTime, 2).await.unwrap();
        assert_eq!(second, vec![4, 5]);
        assert_eq!(store.peek_counter(PreKeyKind::OneTime).await.unwrap(), 6);

        // Kinds do not share counters.
        assert_eq!(store.allocate_ids(PreKeyKind::Signed, 1).await.unwrap(), vec![1]);
        assert_eq!(store.allocate_ids(PreKeyKind::Kem, 1).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn counters_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_temp(&dir).await;
            store.allocate_ids(PreKeyKind::OneTime, 5).await.unwrap();
            store.pool.close().await;
        }
        let store = open_temp(&dir).await;
        assert_eq!(store.allocate_ids(PreKeyKind::OneTime, 1).await.unwrap(), vec![6]);
    }

    #[tokio::test]
    async fn tofu_pin_first_use_then_replaced() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;
        let ids = store.identities();

        assert_eq!(ids.pin("alice", 1, &[1u8; 32]).await.unwrap(), PinOutcome::FirstUse);
        assert_eq!(ids.pin("alice", 1, &[1u8; 32]).await.unwrap(), PinOutcome::Unchanged);
        assert_eq!(ids.pin("alice", 1, &[2u8; 32]).await.unwrap(), PinOutcome::Replaced);

        // The replacement is now the pin.
        let pinned = ids.pinned("alice", 1).await.unwrap().unwrap();
        assert_eq!(pinned.public.as_slice(), &[2u8; 32]);
    }

    #[tokio::test]
    async fn prekey_consumption_markers_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;
        let prekeys = store.prekeys();

        prekeys
            .store_prekey(&PreKeyRecord {
                id: 1,
                public: Blob(vec![1; 32]),
                secret: Blob(vec![2; 32]),
            })
            .await
            .unwrap();

        assert!(!prekeys.prekey_used(1).await.unwrap());
        prekeys.mark_prekey_used(1).await.unwrap();
        prekeys.mark_prekey_used(1).await.unwrap();
        assert!(prekeys.prekey_used(1).await.unwrap());

        // The record itself stays in place.
        assert!(prekeys.load_prekey(1).await.unwrap().is_some());
    }
}
