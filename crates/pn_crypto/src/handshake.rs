//! Asynchronous key agreement: X3DH combined with an ML-KEM encapsulation.
//!
//! References:
//!   - Signal X3DH spec:  <https://signal.org/docs/specifications/x3dh/>
//!   - Signal PQXDH spec: <https://signal.org/docs/specifications/pqxdh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!
//! Protocol:
//!   The initiator fetches the responder's published prekey bundle:
//!     IK_B   (identity, Ed25519 public → converted to X25519)
//!     SPK_B  (signed prekey, X25519) + IK_B signature over SPK_B
//!     OPK_B  (optional one-time prekey, X25519)
//!     PQK_B  (ML-KEM-768 encapsulation key) + IK_B signature over PQK_B
//!
//!   The initiator generates ONE ephemeral keypair EK_A (X25519) and one
//!   KEM encapsulation:
//!     DH1 = DH(IK_A_x25519, SPK_B)      — mutual authentication
//!     DH2 = DH(EK_A,        IK_B_x25519) — forward secrecy
//!     DH3 = DH(EK_A,        SPK_B)      — replay protection
//!     DH4 = DH(EK_A,        OPK_B)      — one-time forward secrecy [optional]
//!     SS  = KEM-Encaps(PQK_B)            — post-quantum contribution
//!
//!   secret = HKDF(salt=0, ikm = 0xFF*32 ‖ DH1..DHn ‖ SS, info="pn-handshake-v1")
//!
//! Non-negotiable:
//!   - Both bundle signatures MUST verify before any DH is computed.
//!   - The initiator sends the handshake header (identity, ephemeral,
//!     consumed prekey ids, KEM ciphertext) with every message until the
//!     responder has demonstrably completed its side.
//!   - The secret feeds the double ratchet as the initial root key.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    codec,
    error::CryptoError,
    identity::{ed25519_pub_to_x25519, ed25519_secret_to_x25519, IdentityKeyPair},
    kdf, kem,
};

const HANDSHAKE_INFO: &[u8] = b"pn-handshake-v1";

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// The public-only projection an identity publishes to the relay so peers
/// can establish sessions without a live handshake. All key fields base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    /// Identity name the bundle belongs to.
    pub id: String,
    /// Ed25519 identity public key.
    pub identity_pub: String,
    pub registration_id: u32,
    pub device: u32,
    pub signed_prekey_id: u32,
    /// X25519 signed prekey.
    pub signed_prekey_pub: String,
    /// Ed25519 signature over the raw SPK public bytes.
    pub signed_prekey_sig: String,
    pub one_time_prekey_id: Option<u32>,
    /// X25519 one-time prekey (consumed once).
    pub one_time_prekey_pub: Option<String>,
    pub kem_prekey_id: u32,
    /// ML-KEM-768 encapsulation key.
    pub kem_prekey_pub: String,
    /// Ed25519 signature over the raw encapsulation-key bytes.
    pub kem_prekey_sig: String,
}

impl PrekeyBundle {
    /// Verify both prekey signatures against the bundle's identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let ik = codec::decode_32(&self.identity_pub)?;
        let spk = codec::decode(&self.signed_prekey_pub)?;
        let spk_sig = codec::decode(&self.signed_prekey_sig)?;
        IdentityKeyPair::verify(&ik, &spk, &spk_sig)?;

        let kem_pub = codec::decode(&self.kem_prekey_pub)?;
        let kem_sig = codec::decode(&self.kem_prekey_sig)?;
        IdentityKeyPair::verify(&ik, &kem_pub, &kem_sig)?;
        Ok(())
    }
}

// ── Handshake header ─────────────────────────────────────────────────────────

/// Sent alongside every initial-type ciphertext so the responder can derive
/// the session secret from its stored prekeys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Initiator's Ed25519 identity public key (base64).
    pub identity_pub: String,
    /// Initiator's ephemeral X25519 public key (base64).
    pub ephemeral_pub: String,
    pub registration_id: u32,
    /// Which responder prekeys were consumed.
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub kem_prekey_id: u32,
    /// ML-KEM ciphertext produced against the responder's KEM prekey (base64).
    pub kem_ciphertext: String,
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Result of the initiator handshake: the session secret, the header the
/// responder needs, and the responder's SPK (the ratchet's first remote key).
pub struct InitiatorHandshake {
    pub secret: [u8; 32],
    pub header: HandshakeHeader,
    pub peer_spk_pub: X25519Public,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Run the initiator side against a peer bundle.
///
/// Steps:
///   1. Verify SPK and KEM signatures under the bundle identity key.
///   2. Convert identity keys to X25519; generate one ephemeral keypair.
///   3. Compute DH1..DH4 and the KEM encapsulation.
///   4. Derive the session secret via HKDF.
pub fn initiate(
    my_ik: &IdentityKeyPair,
    my_registration_id: u32,
    bundle: &PrekeyBundle,
) -> Result<InitiatorHandshake, CryptoError> {
    bundle.verify()?;

    let ik_b_ed = codec::decode_32(&bundle.identity_pub)?;
    let spk_b = X25519Public::from(codec::decode_32(&bundle.signed_prekey_pub)?);

    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(ref opk_b64) = bundle.one_time_prekey_pub {
        let opk_b = X25519Public::from(codec::decode_32(opk_b64)?);
        let dh4 = ek_a.diffie_hellman(&opk_b);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let kem_pub = codec::decode(&bundle.kem_prekey_pub)?;
    let (kem_ct, mut kem_ss) = kem::encapsulate(&kem_pub)?;
    ikm.extend_from_slice(&kem_ss);
    kem_ss.zeroize();

    let mut secret = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), HANDSHAKE_INFO, &mut secret)?;
    ikm.zeroize();

    Ok(InitiatorHandshake {
        secret,
        header: HandshakeHeader {
            identity_pub: my_ik.public_b64(),
            ephemeral_pub: codec::encode(ek_a_pub.as_bytes()),
            registration_id: my_registration_id,
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: bundle.one_time_prekey_id,
            kem_prekey_id: bundle.kem_prekey_id,
            kem_ciphertext: codec::encode(&kem_ct),
        },
        peer_spk_pub: spk_b,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Reconstruct the session secret from a received handshake header.
///
/// `my_spk_secret` — the signed-prekey secret the header references
/// `my_opk_secret` — the consumed one-time prekey secret (if the header used one)
/// `my_kem_secret` — the ML-KEM decapsulation key the header references
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    my_kem_secret: &[u8],
    header: &HandshakeHeader,
) -> Result<[u8; 32], CryptoError> {
    let sender_ik_ed = codec::decode_32(&header.identity_pub)?;
    let ek_a = X25519Public::from(codec::decode_32(&header.ephemeral_pub)?);

    let sender_ik_x = ed25519_pub_to_x25519(&sender_ik_ed)?;
    let ik_b_x = ed25519_secret_to_x25519(my_ik.secret_bytes());

    // Mirror the initiator's DH order exactly (DH is commutative):
    //   DH1 = IK_A × SPK_B
    //   DH2 = EK_A × IK_B
    //   DH3 = EK_A × SPK_B
    //   DH4 = EK_A × OPK_B
    let dh1 = my_spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk_secret) = my_opk_secret {
        let dh4 = opk_secret.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let kem_ct = codec::decode(&header.kem_ciphertext)?;
    let mut kem_ss = kem::decapsulate(my_kem_secret, &kem_ct)?;
    ikm.extend_from_slice(&kem_ss);
    kem_ss.zeroize();

    let mut secret = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), HANDSHAKE_INFO, &mut secret)?;
    ikm.zeroize();

    Ok(secret)
}

// ── Prekey generation ────────────────────────────────────────────────────────

/// Generate a signed prekey: an X25519 keypair with the public half signed
/// by the identity key.
pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> (StaticSecret, X25519Public, Vec<u8>) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes());
    (secret, public, sig)
}

/// Generate a KEM prekey: an ML-KEM-768 keypair with the encapsulation key
/// signed by the identity key.
pub fn generate_kem_prekey(identity: &IdentityKeyPair) -> (kem::KemKeyPair, Vec<u8>) {
    let pair = kem::KemKeyPair::generate();
    let sig = identity.sign(pair.public_bytes());
    (pair, sig)
}
