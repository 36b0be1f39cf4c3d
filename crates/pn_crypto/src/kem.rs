//! Post-quantum KEM prekeys (ML-KEM-768).
//!
//! The KEM contributes a shared secret into the X3DH key agreement so the
//! session secret stays confidential against a harvest-now-decrypt-later
//! adversary. Keys cross this module's boundary in their FIPS 203 encoded
//! byte form; the `ml-kem` types never leak into stored records.

use ml_kem::{
    kem::{Decapsulate, Encapsulate},
    Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem768,
};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

type DecapKey = <MlKem768 as KemCore>::DecapsulationKey;
type EncapKey = <MlKem768 as KemCore>::EncapsulationKey;

/// Encoded key and ciphertext sizes for ML-KEM-768 (FIPS 203).
pub const KEM_PUBLIC_LEN: usize = 1184;
pub const KEM_SECRET_LEN: usize = 2400;
pub const KEM_CIPHERTEXT_LEN: usize = 1088;

/// An ML-KEM keypair in encoded form. Secret half zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct KemKeyPair {
    #[zeroize(skip)]
    public: Vec<u8>,
    secret: Vec<u8>,
}

impl KemKeyPair {
    pub fn generate() -> Self {
        let (dk, ek) = MlKem768::generate(&mut OsRng);
        Self {
            public: ek.as_bytes().to_vec(),
            secret: dk.as_bytes().to_vec(),
        }
    }

    pub fn from_parts(public: Vec<u8>, secret: Vec<u8>) -> Result<Self, CryptoError> {
        if public.len() != KEM_PUBLIC_LEN {
            return Err(CryptoError::Kem(format!(
                "encapsulation key must be {KEM_PUBLIC_LEN} bytes, got {}",
                public.len()
            )));
        }
        if secret.len() != KEM_SECRET_LEN {
            return Err(CryptoError::Kem(format!(
                "decapsulation key must be {KEM_SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }
        Ok(Self { public, secret })
    }

    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

/// Encapsulate to a peer's encoded encapsulation key.
/// Returns (kem_ciphertext, shared_secret).
pub fn encapsulate(public: &[u8]) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let encoded: Encoded<EncapKey> = public
        .try_into()
        .map_err(|_| CryptoError::Kem(format!("encapsulation key must be {KEM_PUBLIC_LEN} bytes")))?;
    let ek = EncapKey::from_bytes(&encoded);

    let (ct, shared) = ek
        .encapsulate(&mut OsRng)
        .expect("ML-KEM encapsulation is infallible");

    let mut out = [0u8; 32];
    out.copy_from_slice(&shared);
    Ok((ct.to_vec(), out))
}

/// Decapsulate a ciphertext with our encoded decapsulation key.
pub fn decapsulate(secret: &[u8], ciphertext: &[u8]) -> Result<[u8; 32], CryptoError> {
    let encoded: Encoded<DecapKey> = secret
        .try_into()
        .map_err(|_| CryptoError::Kem(format!("decapsulation key must be {KEM_SECRET_LEN} bytes")))?;
    let dk = DecapKey::from_bytes(&encoded);

    let ct: Ciphertext<MlKem768> = ciphertext
        .try_into()
        .map_err(|_| CryptoError::Kem(format!("ciphertext must be {KEM_CIPHERTEXT_LEN} bytes")))?;

    let shared = dk
        .decapsulate(&ct)
        .expect("ML-KEM decapsulation is infallible");

    let mut out = [0u8; 32];
    out.copy_from_slice(&shared);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encap_decap_roundtrip() {
        let pair = KemKeyPair::generate();
        assert_eq!(pair.public_bytes().len(), KEM_PUBLIC_LEN);
        assert_eq!(pair.secret_bytes().len(), KEM_SECRET_LEN);

        let (ct, ss_sender) = encapsulate(pair.public_bytes()).unwrap();
        assert_eq!(ct.len(), KEM_CIPHERTEXT_LEN);

        let ss_recipient = decapsulate(pair.secret_bytes(), &ct).unwrap();
        assert_eq!(ss_sender, ss_recipient);
    }

    #[test]
    fn rejects_truncated_keys() {
        assert!(encapsulate(&[0u8; 10]).is_err());
        assert!(decapsulate(&[0u8; 10], &[0u8; KEM_CIPHERTEXT_LEN]).is_err());
    }

    #[test]
    fn keypair_restores_from_parts() {
        let pair = KemKeyPair::generate();
        let restored =
            KemKeyPair::from_parts(pair.public_bytes().to_vec(), pair.secret_bytes().to_vec())
                .unwrap();

        let (ct, ss) = encapsulate(restored.public_bytes()).unwrap();
        assert_eq!(decapsulate(restored.secret_bytes(), &ct).unwrap(), ss);
    }
}
