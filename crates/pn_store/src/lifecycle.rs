//! Identity and prekey lifecycle: bootstrap, minting, bundle export, and
//! session establishment from a peer bundle.
//!
//! An identity is created exactly once per store and is immutable
//! thereafter. Prekeys are minted in batches and published as a bundle;
//! sessions are created lazily and persist indefinitely.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use pn_crypto::codec::{self, Blob};
use pn_crypto::handshake::{self, PrekeyBundle};
use pn_crypto::identity::{generate_registration_id, IdentityKeyPair};
use pn_crypto::ratchet::RatchetState;

use crate::error::StoreError;
use crate::kv::Store;
use crate::stores::{
    IdentityStore, KemPreKeyRecord, KemPreKeyStore, PinOutcome, PreKeyKind, PreKeyRecord,
    PreKeyStore, SessionStore, SignedPreKeyRecord, SignedPreKeyStore, StoredIdentityKeyPair,
};

/// Plaintext identity facts, stored in the meta sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub name: String,
    pub device: u32,
    pub registration_id: u32,
}

/// Ids issued by one `mint_prekeys` call.
#[derive(Debug, Clone)]
pub struct MintedPreKeys {
    pub one_time_ids: Vec<u32>,
    pub signed_id: u32,
    pub kem_id: u32,
}

/// Result of establishing a session from a peer bundle.
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub peer: String,
    pub device: u32,
    /// True when a previously pinned identity key differed from the
    /// bundle's. The session is established regardless; policy is the
    /// caller's.
    pub identity_replaced: bool,
}

/// The identity facts for this store, if bootstrapped.
pub async fn local_identity(store: &Store) -> Result<Option<LocalIdentity>, StoreError> {
    store.meta_get("local").await
}

/// Load the identity keypair; fails if the store was never bootstrapped.
pub async fn identity_keypair(store: &Store) -> Result<IdentityKeyPair, StoreError> {
    let record = store
        .identities()
        .load_local()
        .await?
        .ok_or(StoreError::NoIdentity)?;
    record.keypair()
}

/// Create this store's identity. Only legal once; the identity then lives
/// for the lifetime of the store file.
pub async fn bootstrap_identity(
    store: &Store,
    name: &str,
    device: u32,
) -> Result<LocalIdentity, StoreError> {
    let _guard = store.write_lock().await;
    if store.meta_get::<LocalIdentity>("local").await?.is_some() {
        return Err(StoreError::IdentityExists);
    }

    let keypair = IdentityKeyPair::generate();
    let local = LocalIdentity {
        name: name.to_string(),
        device,
        registration_id: generate_registration_id(),
    };

    store
        .identities()
        .store_local(&StoredIdentityKeyPair {
            public: Blob::from(keypair.public_bytes().as_slice()),
            secret: Blob::from(keypair.secret_bytes().as_slice()),
        })
        .await?;
    store.meta_set("local", &local).await?;

    info!(name, device, registration_id = local.registration_id, "identity bootstrapped");
    Ok(local)
}

/// Mint `n` one-time prekeys plus one signed and one KEM prekey, all ids
/// allocated from the per-kind monotonic counters.
pub async fn mint_prekeys(store: &Store, n: u32) -> Result<MintedPreKeys, StoreError> {
    let identity = identity_keypair(store).await?;
    let now_ms = Utc::now().timestamp_millis() as u64;

    let one_time_ids = store.allocate_ids(PreKeyKind::OneTime, n).await?;
    for &id in &one_time_ids {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret);
        store
            .prekeys()
            .store_prekey(&PreKeyRecord {
                id,
                public: Blob::from(public.as_bytes().as_slice()),
                secret: Blob::from(secret.to_bytes().as_slice()),
            })
            .await?;
    }

    let signed_id = store.allocate_ids(PreKeyKind::Signed, 1).await?[0];
    let (spk_secret, spk_public, spk_sig) = handshake::generate_signed_prekey(&identity);
    store
        .signed_prekeys()
        .store_signed_prekey(&SignedPreKeyRecord {
            id: signed_id,
            created_at_ms: now_ms,
            public: Blob::from(spk_public.as_bytes().as_slice()),
            secret: Blob::from(spk_secret.to_bytes().as_slice()),
            signature: Blob::from(spk_sig.as_slice()),
        })
        .await?;

    let kem_id = store.allocate_ids(PreKeyKind::Kem, 1).await?[0];
    let (kem_pair, kem_sig) = handshake::generate_kem_prekey(&identity);
    store
        .kem_prekeys()
        .store_kem_prekey(&KemPreKeyRecord {
            id: kem_id,
            created_at_ms: now_ms,
            public: Blob::from(kem_pair.public_bytes()),
            secret: Blob::from(kem_pair.secret_bytes()),
            signature: Blob::from(kem_sig.as_slice()),
        })
        .await?;

    debug!(one_time = n, signed_id, kem_id, "prekeys minted");
    Ok(MintedPreKeys { one_time_ids, signed_id, kem_id })
}

/// Public-only projection of the most recently minted prekeys of each kind.
pub async fn export_bundle(store: &Store) -> Result<PrekeyBundle, StoreError> {
    let local = local_identity(store).await?.ok_or(StoreError::NoIdentity)?;
    let identity = identity_keypair(store).await?;

    let latest = |kind: PreKeyKind| async move {
        let next = store.peek_counter(kind).await?;
        Ok::<Option<u32>, StoreError>((next > 1).then(|| next - 1))
    };

    let one_time_id = latest(PreKeyKind::OneTime).await?;
    let signed_id =
        latest(PreKeyKind::Signed).await?.ok_or(StoreError::BundleIncomplete("signed prekey"))?;
    let kem_id =
        latest(PreKeyKind::Kem).await?.ok_or(StoreError::BundleIncomplete("KEM prekey"))?;

    let signed = store
        .signed_prekeys()
        .load_signed_prekey(signed_id)
        .await?
        .ok_or(StoreError::BundleIncomplete("signed prekey"))?;
    let kem = store
        .kem_prekeys()
        .load_kem_prekey(kem_id)
        .await?
        .ok_or(StoreError::BundleIncomplete("KEM prekey"))?;

    let (one_time_prekey_id, one_time_prekey_pub) = match one_time_id {
        None => (None, None),
        Some(id) => {
            let record = store
                .prekeys()
                .load_prekey(id)
                .await?
                .ok_or(StoreError::BundleIncomplete("one-time prekey"))?;
            (Some(id), Some(codec::encode(record.public.as_slice())))
        }
    };

    Ok(PrekeyBundle {
        id: local.name,
        identity_pub: identity.public_b64(),
        registration_id: local.registration_id,
        device: local.device,
        signed_prekey_id: signed.id,
        signed_prekey_pub: codec::encode(signed.public.as_slice()),
        signed_prekey_sig: codec::encode(signed.signature.as_slice()),
        one_time_prekey_id,
        one_time_prekey_pub,
        kem_prekey_id: kem.id,
        kem_prekey_pub: codec::encode(kem.public.as_slice()),
        kem_prekey_sig: codec::encode(kem.signature.as_slice()),
    })
}

/// Establish a session with the peer described by `bundle` (initiator side).
///
/// Verifies the bundle signatures, runs the handshake, writes the session
/// record, and pins the peer identity trust-on-first-use. A pre-existing pin
/// that differs does not abort — the session is written and the replacement
/// is reported.
pub async fn init_session_from_bundle(
    store: &Store,
    bundle: &PrekeyBundle,
) -> Result<SessionInit, StoreError> {
    let local = local_identity(store).await?.ok_or(StoreError::NoIdentity)?;
    let identity = identity_keypair(store).await?;

    let handshake = handshake::initiate(&identity, local.registration_id, bundle).map_err(|e| {
        match e {
            pn_crypto::CryptoError::SignatureVerification => StoreError::BundleUnauthentic,
            other => StoreError::Crypto(other),
        }
    })?;

    let _guard = store.write_lock().await;

    let state = RatchetState::init_initiator(
        bundle.id.clone(),
        bundle.device,
        handshake.secret,
        &handshake.peer_spk_pub,
        handshake.header,
    )?;
    store.sessions().store_session(&state).await?;

    let peer_identity = codec::decode(&bundle.identity_pub)?;
    let outcome = store.identities().pin(&bundle.id, bundle.device, &peer_identity).await?;
    let identity_replaced = outcome == PinOutcome::Replaced;
    if identity_replaced {
        tracing::warn!(peer = %bundle.id, "peer identity key replaced at session init");
    }

    debug!(peer = %bundle.id, device = bundle.device, "session established from bundle");
    Ok(SessionInit { peer: bundle.id.clone(), device: bundle.device, identity_replaced })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::session_key;
    use tempfile::TempDir;

    async fn open_temp(dir: &TempDir, name: &str) -> Store {
        Store::open(&dir.path().join(format!("{name}.db")), "alpha").await.unwrap()
    }

    #[tokio::test]
    async fn bootstrap_is_once_only() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir, "alice").await;

        let local = bootstrap_identity(&store, "alice", 1).await.unwrap();
        assert_eq!(local.name, "alice");
        assert!((1..=16380).contains(&local.registration_id));

        assert!(matches!(
            bootstrap_identity(&store, "alice", 1).await,
            Err(StoreError::IdentityExists)
        ));
    }

    #[tokio::test]
    async fn export_bundle_requires_minting() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir, "alice").await;
        bootstrap_identity(&store, "alice", 1).await.unwrap();

        assert!(matches!(
            export_bundle(&store).await,
            Err(StoreError::BundleIncomplete(_))
        ));
    }

    #[tokio::test]
    async fn minted_bundle_verifies_and_names_latest_ids() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir, "alice").await;
        bootstrap_identity(&store, "alice", 1).await.unwrap();
        mint_prekeys(&store, 5).await.unwrap();

        let bundle = export_bundle(&store).await.unwrap();
        assert_eq!(bundle.id, "alice");
        assert_eq!(bundle.device, 1);
        assert_eq!(bundle.one_time_prekey_id, Some(5));
        assert_eq!(bundle.signed_prekey_id, 1);
        assert_eq!(bundle.kem_prekey_id, 1);
        bundle.verify().unwrap();

        // A second mint rotates the bundle to the new ids.
        mint_prekeys(&store, 2).await.unwrap();
        let bundle = export_bundle(&store).await.unwrap();
        assert_eq!(bundle.one_time_prekey_id, Some(7));
        assert_eq!(bundle.signed_prekey_id, 2);
        assert_eq!(bundle.kem_prekey_id, 2);
    }

    #[tokio::test]
    async fn session_init_writes_session_and_pin() {
        let dir = TempDir::new().unwrap();
        let alice = open_temp(&dir, "alice").await;
        bootstrap_identity(&alice, "alice", 1).await.unwrap();
        mint_prekeys(&alice, 3).await.unwrap();
        let bundle = export_bundle(&alice).await.unwrap();

        let bob = open_temp(&dir, "bob").await;
        bootstrap_identity(&bob, "bob", 1).await.unwrap();

        let init = init_session_from_bundle(&bob, &bundle).await.unwrap();
        assert!(!init.identity_replaced);

        assert!(bob.sessions().has_session("alice", 1).await.unwrap());
        assert!(bob
            .get::<serde_json::Value>(&session_key("alice", 1))
            .await
            .unwrap()
            .is_some());

        let pinned = bob.identities().pinned("alice", 1).await.unwrap().unwrap();
        let alice_ik = identity_keypair(&alice).await.unwrap();
        assert_eq!(pinned.public.as_slice(), alice_ik.public_bytes());
    }

    #[tokio::test]
    async fn tampered_bundle_is_unauthentic() {
        let dir = TempDir::new().unwrap();
        let alice = open_temp(&dir, "alice").await;
        bootstrap_identity(&alice, "alice", 1).await.unwrap();
        mint_prekeys(&alice, 1).await.unwrap();
        let mut bundle = export_bundle(&alice).await.unwrap();

        // Swap in a signature from a different identity.
        let evil = IdentityKeyPair::generate();
        let spk = codec::decode(&bundle.signed_prekey_pub).unwrap();
        bundle.signed_prekey_sig = codec::encode(&evil.sign(&spk));

        let bob = open_temp(&dir, "bob").await;
        bootstrap_identity(&bob, "bob", 1).await.unwrap();
        assert!(matches!(
            init_session_from_bundle(&bob, &bundle).await,
            Err(StoreError::BundleUnauthentic)
        ));
    }
}
