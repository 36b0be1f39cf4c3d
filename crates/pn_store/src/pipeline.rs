//! Envelope encrypt/decrypt on top of the typed stores.
//!
//! The session record is a read-modify-write critical section: callers MUST
//! serialize encrypt/decrypt per (local, peer). The store's writer lock
//! covers the record rewrite itself; cross-call ordering belongs to the
//! daemon's per-peer queue.
//!
//! Wire forms:
//!   initial    — handshake header + ratchet header + AEAD ciphertext.
//!                Sent until the peer's first reply; carries the prekey
//!                references that let the responder derive the session.
//!   subsequent — ratchet header + AEAD ciphertext on an established session.
//!
//! On any decrypt failure the stored session is left untouched — the state
//! advance is only persisted together with a successfully opened plaintext.

use tracing::debug;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use pn_crypto::{aead, codec, handshake, ratchet::RatchetState, CryptoError};
use pn_proto::envelope::{Envelope, EnvelopeType, InitialPayload, SubsequentPayload};

use crate::error::StoreError;
use crate::kv::Store;
use crate::lifecycle;
use crate::stores::{
    IdentityStore, KemPreKeyStore, PreKeyStore, SessionStore, SignedPreKeyStore,
};

/// Single-device deployment: every peer is addressed at device 1.
pub const DEFAULT_DEVICE: u32 = 1;

fn map_ratchet_err(e: CryptoError) -> StoreError {
    match e {
        CryptoError::TooManySkipped { .. } => StoreError::OutOfOrderIrrecoverable,
        other => StoreError::Crypto(other),
    }
}

/// Encrypt `plaintext` for `peer`. Requires an established session — run
/// `init_session_from_bundle` first for a new peer.
pub async fn encrypt(store: &Store, peer: &str, plaintext: &[u8]) -> Result<Envelope, StoreError> {
    let local = lifecycle::local_identity(store).await?.ok_or(StoreError::NoIdentity)?;

    let _guard = store.write_lock().await;
    let mut state = store
        .sessions()
        .load_session(peer, DEFAULT_DEVICE)
        .await?
        .ok_or_else(|| StoreError::SessionNotEstablished(peer.to_string()))?;

    let (ratchet_header, mut mk) = state.encrypt_step()?;
    let sealed = aead::seal(&mk, plaintext);
    mk.zeroize();
    let ciphertext = codec::encode(&sealed?);

    let (kind, body) = match state.pending_handshake() {
        Some(handshake) => (
            EnvelopeType::Initial,
            serde_json::to_vec(&InitialPayload {
                handshake: handshake.clone(),
                ratchet: ratchet_header,
                ciphertext,
            })?,
        ),
        None => (
            EnvelopeType::Subsequent,
            serde_json::to_vec(&SubsequentPayload { ratchet: ratchet_header, ciphertext })?,
        ),
    };

    // The session advance persists together with the produced ciphertext.
    store.sessions().store_session(&state).await?;

    debug!(peer, ?kind, n = state.send_n, "encrypted outbound message");
    Ok(Envelope::new(&local.name, peer, kind, &body))
}

/// Decrypt an inbound envelope addressed to this store's identity.
pub async fn decrypt(store: &Store, envelope: &Envelope) -> Result<Vec<u8>, StoreError> {
    envelope.validate()?;
    match envelope.kind {
        EnvelopeType::Initial => decrypt_initial(store, envelope).await,
        EnvelopeType::Subsequent => decrypt_subsequent(store, envelope).await,
    }
}

async fn decrypt_initial(store: &Store, envelope: &Envelope) -> Result<Vec<u8>, StoreError> {
    let peer = envelope.sender.as_str();
    let payload: InitialPayload = serde_json::from_slice(&envelope.body_bytes()?)?;

    let _guard = store.write_lock().await;

    // Trust-on-first-use: a pinned key that differs from the handshake's
    // claimed identity refuses the message outright.
    let claimed_identity = codec::decode(&payload.handshake.identity_pub)?;
    if let Some(pinned) = store.identities().pinned(peer, DEFAULT_DEVICE).await? {
        if !codec::ct_eq(pinned.public.as_slice(), &claimed_identity) {
            return Err(StoreError::IdentityMismatch(peer.to_string()));
        }
    }

    // Reuse the session when this is another message of the same handshake
    // (the initiator keeps attaching it until our first reply lands).
    let existing = store.sessions().load_session(peer, DEFAULT_DEVICE).await?;
    let mut state = match existing {
        Some(state)
            if state.handshake_ephemeral() == Some(payload.handshake.ephemeral_pub.as_str()) =>
        {
            state
        }
        _ => build_responder_session(store, peer, &payload.handshake).await?,
    };

    let mut mk = state.decrypt_step(&payload.ratchet).map_err(map_ratchet_err)?;
    let sealed = codec::decode(&payload.ciphertext)?;
    let plaintext = aead::open(&mk, &sealed);
    mk.zeroize();
    let plaintext = plaintext.map_err(|_| StoreError::IntegrityFailed)?;

    // Only now touch durable state: consume the referenced prekeys, pin the
    // sender identity, persist the advanced session.
    if let Some(id) = payload.handshake.one_time_prekey_id {
        store.prekeys().mark_prekey_used(id).await?;
    }
    store.kem_prekeys().mark_kem_prekey_used(payload.handshake.kem_prekey_id).await?;
    store.identities().pin(peer, DEFAULT_DEVICE, &claimed_identity).await?;
    store.sessions().store_session(&state).await?;

    debug!(peer, "decrypted initial message, session established");
    Ok(plaintext.to_vec())
}

async fn build_responder_session(
    store: &Store,
    peer: &str,
    header: &handshake::HandshakeHeader,
) -> Result<RatchetState, StoreError> {
    let identity = lifecycle::identity_keypair(store).await?;

    let signed = store
        .signed_prekeys()
        .load_signed_prekey(header.signed_prekey_id)
        .await?
        .ok_or_else(|| {
            StoreError::SessionSetupFailed(format!(
                "signed prekey {} not found",
                header.signed_prekey_id
            ))
        })?;

    let one_time = match header.one_time_prekey_id {
        None => None,
        Some(id) => Some(store.prekeys().load_prekey(id).await?.ok_or_else(|| {
            StoreError::SessionSetupFailed(format!("one-time prekey {id} not found"))
        })?),
    };

    let kem = store
        .kem_prekeys()
        .load_kem_prekey(header.kem_prekey_id)
        .await?
        .ok_or_else(|| {
            StoreError::SessionSetupFailed(format!("KEM prekey {} not found", header.kem_prekey_id))
        })?;

    let spk_secret = StaticSecret::from(to_32(signed.secret.as_slice())?);
    let spk_pub = X25519Public::from(to_32(signed.public.as_slice())?);
    let opk_secret = match &one_time {
        None => None,
        Some(record) => Some(StaticSecret::from(to_32(record.secret.as_slice())?)),
    };

    let secret = handshake::respond(
        &identity,
        &spk_secret,
        opk_secret.as_ref(),
        kem.secret.as_slice(),
        header,
    )?;

    Ok(RatchetState::init_responder(
        peer.to_string(),
        DEFAULT_DEVICE,
        secret,
        &spk_secret,
        &spk_pub,
        header.ephemeral_pub.clone(),
    ))
}

async fn decrypt_subsequent(store: &Store, envelope: &Envelope) -> Result<Vec<u8>, StoreError> {
    let peer = envelope.sender.as_str();
    let payload: SubsequentPayload = serde_json::from_slice(&envelope.body_bytes()?)?;

    let _guard = store.write_lock().await;
    let mut state = store
        .sessions()
        .load_session(peer, DEFAULT_DEVICE)
        .await?
        .ok_or_else(|| StoreError::NoSession(peer.to_string()))?;

    let mut mk = state.decrypt_step(&payload.ratchet).map_err(map_ratchet_err)?;
    let sealed = codec::decode(&payload.ciphertext)?;
    let plaintext = aead::open(&mk, &sealed);
    mk.zeroize();
    let plaintext = plaintext.map_err(|_| StoreError::IntegrityFailed)?;

    store.sessions().store_session(&state).await?;
    Ok(plaintext.to_vec())
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Crypto(CryptoError::InvalidKey("expected 32-byte key".into())))
}
