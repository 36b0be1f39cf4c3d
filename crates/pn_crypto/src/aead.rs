//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM.  Key size: 32 bytes.  IV: 12 bytes (random per call).
//! Tag: 16 bytes.  Additional authenticated data: empty.
//!
//! Ciphertext wire format:
//!   [ iv (12 bytes) | tag (16 bytes) | ciphertext ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` with a 32-byte key. The IV is sampled from the
/// system CSPRNG and prepended, followed by the authentication tag.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadSeal)?;
    let iv = Aes256Gcm::generate_nonce(&mut AeadOsRng);

    // aes-gcm produces ct ‖ tag; the wire order is iv ‖ tag ‖ ct.
    let ct_and_tag = cipher
        .encrypt(&iv, plaintext)
        .map_err(|_| CryptoError::AeadSeal)?;
    let split = ct_and_tag.len() - TAG_LEN;

    let mut out = Vec::with_capacity(IV_LEN + ct_and_tag.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct_and_tag[split..]);
    out.extend_from_slice(&ct_and_tag[..split]);
    Ok(out)
}

/// Decrypt wire-format bytes (iv ‖ tag ‖ ct).
///
/// Any tag mismatch is a non-recoverable integrity failure for that record.
pub fn open(key: &[u8; 32], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::AeadOpen);
    }
    let (iv, rest) = data.split_at(IV_LEN);
    let (tag, ct) = rest.split_at(TAG_LEN);

    let mut ct_and_tag = Vec::with_capacity(rest.len());
    ct_and_tag.extend_from_slice(ct);
    ct_and_tag.extend_from_slice(tag);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadOpen)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ct_and_tag.as_ref())
        .map_err(|_| CryptoError::AeadOpen)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"attack at dawn").unwrap();
        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"attack at dawn");
    }

    #[test]
    fn wire_layout() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"hello").unwrap();
        assert_eq!(sealed.len(), IV_LEN + TAG_LEN + 5);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&[1u8; 32], b"secret").unwrap();
        assert!(open(&[2u8; 32], &sealed).is_err());
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let key = [9u8; 32];
        let sealed = seal(&key, b"integrity").unwrap();
        for byte in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[byte] ^= 0x01;
            assert!(open(&key, &tampered).is_err(), "flip at byte {byte} went undetected");
        }
    }

    #[test]
    fn fresh_iv_per_call() {
        let key = [3u8; 32];
        let a = seal(&key, b"same plaintext").unwrap();
        let b = seal(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }
}
