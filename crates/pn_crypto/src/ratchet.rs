//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! The state keeps four kinds of key material apart: the root key (folded
//! forward on every DH turn), one chain key per direction (advanced per
//! message), and single-use message keys derived from a chain link and
//! dropped immediately. A "turn" happens when a message arrives under a
//! ratchet public key we have not seen: the DH output refreshes the
//! receiving chain, and a fresh local keypair refreshes the sending chain,
//! which is what heals the session after a compromise.
//!
//! The serialized state is the session record: one per (local, peer, device),
//! rewritten after every successful encrypt or decrypt, stored only sealed.
//! The initiator's state carries the handshake header until the peer's first
//! message proves the handshake completed; while it is present, outbound
//! ciphertexts are the initial (prekey-carrying) wire form.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use rand::rngs::OsRng;

use crate::codec;
use crate::error::CryptoError;
use crate::handshake::HandshakeHeader;

/// Maximum number of skipped message keys stored per session. Limits memory
/// and bounds DoS via huge counter jumps; beyond it the message is
/// irrecoverably out of order.
const MAX_SKIP: u64 = 256;

// ── Ratchet header (sent unencrypted with every message) ─────────────────────

/// Lets the recipient advance its ratchet to the right message key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key (base64).
    pub dh_pub: String,
    /// Message number in the current sending chain.
    pub n: u64,
    /// Number of messages in the previous sending chain (for skip handling).
    pub pn: u64,
}

/// A message key parked for an out-of-order arrival, addressed by the chain
/// it belongs to and its position in that chain.
#[derive(Serialize, Deserialize)]
struct SkippedKey {
    dh_pub: String,
    n: u64,
    mk: [u8; 32],
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete double-ratchet session state for one (local, peer, device).
/// Persisted only as an AEAD ciphertext in the local store.
#[derive(Serialize, Deserialize)]
pub struct RatchetState {
    pub peer: String,
    pub device: u32,

    root_key: [u8; 32],

    /// Our current DH ratchet secret. Replaced on every turn.
    dh_send_secret: [u8; 32],
    dh_send_pub: [u8; 32],
    send_ck: [u8; 32],
    /// Send counter (resets to 0 on a turn).
    pub send_n: u64,

    /// The ratchet public key the peer last sent under, if any.
    dh_recv_pub: Option<[u8; 32]>,
    recv_ck: [u8; 32],
    pub recv_n: u64,
    pub prev_send_n: u64,

    /// Message keys for out-of-order arrivals. Bounded by MAX_SKIP.
    skipped: Vec<SkippedKey>,

    /// Initiator side: the handshake header attached to outbound messages
    /// until the peer's first message arrives. `None` once established.
    pending_handshake: Option<HandshakeHeader>,

    /// Responder side: the ephemeral key of the handshake that established
    /// this session. Replayed initial messages from the same handshake are
    /// routed into this session instead of replacing it.
    remote_handshake_ephemeral: Option<String>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for entry in self.skipped.iter_mut() {
            entry.mk.zeroize();
        }
    }
}

impl RatchetState {
    /// Create a session as the INITIATOR.
    ///
    /// The handshake secret is the first root key; the peer's SPK is the
    /// first "received" ratchet key, and a DH step runs immediately.
    pub fn init_initiator(
        peer: String,
        device: u32,
        mut secret: [u8; 32],
        peer_spk_pub: &X25519Public,
        header: HandshakeHeader,
    ) -> Result<Self, CryptoError> {
        let dh_send_secret = StaticSecret::random_from_rng(OsRng);
        let dh_send_pub = X25519Public::from(&dh_send_secret).to_bytes();

        let shared = dh_send_secret.diffie_hellman(peer_spk_pub);
        let (root_key, send_ck) = root_advance(&secret, shared.as_bytes())?;
        secret.zeroize();

        Ok(Self {
            peer,
            device,
            root_key,
            dh_send_secret: dh_send_secret.to_bytes(),
            dh_send_pub,
            send_ck,
            send_n: 0,
            dh_recv_pub: Some(peer_spk_pub.to_bytes()),
            recv_ck: [0u8; 32], // set by the peer's first message
            recv_n: 0,
            prev_send_n: 0,
            skipped: Vec::new(),
            pending_handshake: Some(header),
            remote_handshake_ephemeral: None,
        })
    }

    /// Create a session as the RESPONDER.
    ///
    /// The SPK secret is the initial ratchet key; the first turn happens
    /// when the initiator's first message (with its ratchet key) arrives.
    pub fn init_responder(
        peer: String,
        device: u32,
        secret: [u8; 32],
        my_spk_secret: &StaticSecret,
        my_spk_pub: &X25519Public,
        handshake_ephemeral: String,
    ) -> Self {
        Self {
            peer,
            device,
            root_key: secret,
            dh_send_secret: my_spk_secret.to_bytes(),
            dh_send_pub: my_spk_pub.to_bytes(),
            send_ck: [0u8; 32], // set on the first turn when sending
            send_n: 0,
            dh_recv_pub: None,
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped: Vec::new(),
            pending_handshake: None,
            remote_handshake_ephemeral: Some(handshake_ephemeral),
        }
    }

    /// True while outbound messages must carry the handshake header.
    pub fn is_initial(&self) -> bool {
        self.pending_handshake.is_some()
    }

    pub fn pending_handshake(&self) -> Option<&HandshakeHeader> {
        self.pending_handshake.as_ref()
    }

    /// The handshake ephemeral this responder session was built from.
    pub fn handshake_ephemeral(&self) -> Option<&str> {
        self.remote_handshake_ephemeral.as_deref()
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Advance the sending chain. Returns (header, message_key); the caller
    /// seals the plaintext under the message key.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, [u8; 32]), CryptoError> {
        let (next_ck, mk) = chain_advance(&self.send_ck)?;
        self.send_ck = next_ck;
        let header = RatchetHeader {
            dh_pub: codec::encode(&self.dh_send_pub),
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;
        Ok((header, mk))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Derive the message key for a received message: either a parked key
    /// from an earlier skip, or the next link of the receiving chain after
    /// an optional ratchet turn and skip-ahead.
    ///
    /// A successful step also acknowledges the handshake: subsequent
    /// outbound messages drop the prekey header.
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        let peer_dh = codec::decode_32(&header.dh_pub)?;

        if let Some(mk) = self.take_skipped(&header.dh_pub, header.n) {
            self.pending_handshake = None;
            return Ok(mk);
        }

        if self.dh_recv_pub.map_or(true, |current| current != peer_dh) {
            // The peer turned the ratchet. Park whatever remains of the old
            // receiving chain first, so its stragglers stay decryptable.
            if self.dh_recv_pub.is_some() {
                self.park_skipped(header.pn)?;
            }
            self.turn(peer_dh)?;
        }

        self.park_skipped(header.n)?;

        let (next_ck, mk) = chain_advance(&self.recv_ck)?;
        self.recv_ck = next_ck;
        self.recv_n += 1;

        self.pending_handshake = None;
        Ok(mk)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// One full DH turn against the peer's new ratchet key: refresh the
    /// receiving chain from our current secret, then swap in a fresh local
    /// keypair and refresh the sending chain from it.
    fn turn(&mut self, peer_dh: [u8; 32]) -> Result<(), CryptoError> {
        let peer = X25519Public::from(peer_dh);
        self.dh_recv_pub = Some(peer_dh);

        let ours = StaticSecret::from(self.dh_send_secret);
        let (root, recv_ck) = root_advance(&self.root_key, ours.diffie_hellman(&peer).as_bytes())?;
        self.root_key = root;
        self.recv_ck = recv_ck;
        self.recv_n = 0;

        self.prev_send_n = self.send_n;
        self.send_n = 0;
        let fresh = StaticSecret::random_from_rng(OsRng);
        let (root, send_ck) = root_advance(&self.root_key, fresh.diffie_hellman(&peer).as_bytes())?;
        self.root_key = root;
        self.send_ck = send_ck;
        self.dh_send_pub = X25519Public::from(&fresh).to_bytes();
        self.dh_send_secret = fresh.to_bytes();
        Ok(())
    }

    /// Remove and return the parked key for (chain, n), if one exists.
    fn take_skipped(&mut self, dh_pub: &str, n: u64) -> Option<[u8; 32]> {
        let idx = self.skipped.iter().position(|s| s.n == n && s.dh_pub == dh_pub)?;
        Some(self.skipped.swap_remove(idx).mk)
    }

    /// Walk the receiving chain forward to `until`, parking every key we
    /// pass over. Oldest parked keys are evicted past the MAX_SKIP bound.
    fn park_skipped(&mut self, until: u64) -> Result<(), CryptoError> {
        let Some(span) = until.checked_sub(self.recv_n) else {
            return Ok(()); // chain already past this position
        };
        if span > MAX_SKIP {
            return Err(CryptoError::TooManySkipped { got: span, max: MAX_SKIP });
        }

        let chain = self.dh_recv_pub.map(|k| codec::encode(&k)).unwrap_or_default();
        for _ in 0..span {
            let (next_ck, mk) = chain_advance(&self.recv_ck)?;
            self.recv_ck = next_ck;
            self.skipped.push(SkippedKey { dh_pub: chain.clone(), n: self.recv_n, mk });
            self.recv_n += 1;
        }

        if self.skipped.len() > MAX_SKIP as usize {
            let overflow = self.skipped.len() - MAX_SKIP as usize;
            for mut evicted in self.skipped.drain(..overflow) {
                evicted.mk.zeroize();
            }
        }
        Ok(())
    }
}

// ── Key schedule ─────────────────────────────────────────────────────────────

/// Fold a DH output into the root key. A single HKDF expand yields 64
/// bytes; the first half is the next root key, the second the new chain
/// key for whichever direction is turning.
fn root_advance(root: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(root), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(b"postern-root-step", &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((next_root, chain))
}

/// One symmetric chain step: (next_chain_key, message_key). The 0x01/0x02
/// labels are the KDF_CK construction from the double-ratchet spec, which
/// keeps the message key independent of the next chain link.
fn chain_advance(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    Ok((hmac_label(ck, 0x01)?, hmac_label(ck, 0x02)?))
}

fn hmac_label(key: &[u8; 32], label: u8) -> Result<[u8; 32], CryptoError> {
    use hmac::{Hmac, Mac};
    let mut mac = <Hmac<sha2::Sha256>>::new_from_slice(key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[label]);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_header() -> HandshakeHeader {
        HandshakeHeader {
            identity_pub: codec::encode(&[1u8; 32]),
            ephemeral_pub: codec::encode(&[2u8; 32]),
            registration_id: 1,
            signed_prekey_id: 1,
            one_time_prekey_id: None,
            kem_prekey_id: 1,
            kem_ciphertext: codec::encode(&[0u8; 8]),
        }
    }

    fn pair() -> (RatchetState, RatchetState) {
        let secret = [42u8; 32];
        let bob_spk = StaticSecret::random_from_rng(OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);

        let alice = RatchetState::init_initiator(
            "bob".into(),
            1,
            secret,
            &bob_spk_pub,
            dummy_header(),
        )
        .unwrap();

        let bob = RatchetState::init_responder(
            "alice".into(),
            1,
            secret,
            &bob_spk,
            &bob_spk_pub,
            codec::encode(&[2u8; 32]),
        );
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = pair();

        for i in 0..3 {
            let (header, mk_alice) = alice.encrypt_step().unwrap();
            let mk_bob = bob.decrypt_step(&header).unwrap();
            assert_eq!(mk_alice, mk_bob, "message {i}: keys must match");
        }

        // Bob replies (a turn on both sides).
        for i in 0..2 {
            let (header, mk_bob) = bob.encrypt_step().unwrap();
            let mk_alice = alice.decrypt_step(&header).unwrap();
            assert_eq!(mk_bob, mk_alice, "reply {i}: keys must match");
        }

        let (header, mk_a) = alice.encrypt_step().unwrap();
        let mk_b = bob.decrypt_step(&header).unwrap();
        assert_eq!(mk_a, mk_b);
    }

    #[test]
    fn message_keys_never_repeat() {
        let (mut alice, mut bob) = pair();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..8 {
            let (header, mk) = alice.encrypt_step().unwrap();
            assert!(seen.insert(mk), "message key repeated");
            bob.decrypt_step(&header).unwrap();

            let (header, mk) = bob.encrypt_step().unwrap();
            assert!(seen.insert(mk), "message key repeated");
            alice.decrypt_step(&header).unwrap();
        }
    }

    #[test]
    fn out_of_order_messages() {
        let (mut alice, mut bob) = pair();

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, mk1) = alice.encrypt_step().unwrap();
        let (h2, mk2) = alice.encrypt_step().unwrap();

        // Message 2 first (skipping 0 and 1), then the stragglers.
        assert_eq!(mk2, bob.decrypt_step(&h2).unwrap());
        assert_eq!(mk0, bob.decrypt_step(&h0).unwrap());
        assert_eq!(mk1, bob.decrypt_step(&h1).unwrap());
    }

    #[test]
    fn stragglers_from_the_previous_chain_survive_a_turn() {
        let (mut alice, mut bob) = pair();

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, _) = alice.encrypt_step().unwrap();
        let (h2, mk2) = alice.encrypt_step().unwrap();

        // Bob sees only the middle message, replies (turning the ratchet),
        // and alice turns too on her next send.
        bob.decrypt_step(&h1).unwrap();
        let (reply, _) = bob.encrypt_step().unwrap();
        alice.decrypt_step(&reply).unwrap();
        let (h3, mk3) = alice.encrypt_step().unwrap();
        assert_eq!(mk3, bob.decrypt_step(&h3).unwrap());

        // The old chain's stragglers were parked across the turn.
        assert_eq!(mk0, bob.decrypt_step(&h0).unwrap());
        assert_eq!(mk2, bob.decrypt_step(&h2).unwrap());
    }

    #[test]
    fn excessive_skip_is_irrecoverable() {
        let (mut alice, mut bob) = pair();

        let header = RatchetHeader {
            dh_pub: {
                let (h, _) = alice.encrypt_step().unwrap();
                h.dh_pub
            },
            n: MAX_SKIP + 10,
            pn: 0,
        };
        assert!(matches!(
            bob.decrypt_step(&header),
            Err(CryptoError::TooManySkipped { .. })
        ));
    }

    #[test]
    fn first_inbound_clears_pending_handshake() {
        let (mut alice, mut bob) = pair();
        assert!(alice.is_initial());

        let (header, _) = alice.encrypt_step().unwrap();
        bob.decrypt_step(&header).unwrap();
        // Alice stays initial until she hears back.
        assert!(alice.is_initial());

        let (reply, _) = bob.encrypt_step().unwrap();
        alice.decrypt_step(&reply).unwrap();
        assert!(!alice.is_initial());
    }

    #[test]
    fn state_survives_serialization() {
        let (mut alice, mut bob) = pair();

        let (h0, _) = alice.encrypt_step().unwrap();
        bob.decrypt_step(&h0).unwrap();

        // Persist and reload both sides mid-conversation.
        let alice_json = serde_json::to_vec(&alice).unwrap();
        let bob_json = serde_json::to_vec(&bob).unwrap();
        let mut alice: RatchetState = serde_json::from_slice(&alice_json).unwrap();
        let mut bob: RatchetState = serde_json::from_slice(&bob_json).unwrap();

        let (h1, mk_b) = bob.encrypt_step().unwrap();
        assert_eq!(mk_b, alice.decrypt_step(&h1).unwrap());
    }
}
