//! Envelope signatures.
//!
//! Current envelopes sign
//!
//! ```text
//! "strongvelope-sig" ++ version(1) ++ envelope_type(1) ++ send_key(16) ++ signed_content
//! ```
//!
//! so a valid signature cannot be replayed with a substituted key. Legacy
//! (version 1) envelopes sign only the prefix and the signed content.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::{
    error::{CryptoError, Result},
    keys::{PUBLIC_KEY_SIZE, SEND_KEY_SIZE, SendKey},
};

/// Domain separation prefix of every signed blob
pub const SIGNATURE_PREFIX: &[u8] = b"strongvelope-sig";

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Bytes signed for a current-layout envelope
pub fn signing_data(
    version: u8,
    envelope_type: u8,
    key: &SendKey,
    signed_content: &[u8],
) -> Vec<u8> {
    let mut data =
        Vec::with_capacity(SIGNATURE_PREFIX.len() + 2 + SEND_KEY_SIZE + signed_content.len());
    data.extend_from_slice(SIGNATURE_PREFIX);
    data.push(version);
    data.push(envelope_type);
    data.extend_from_slice(key.as_bytes());
    data.extend_from_slice(signed_content);
    data
}

/// Bytes signed for a legacy envelope
pub fn legacy_signing_data(signed_content: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(SIGNATURE_PREFIX.len() + signed_content.len());
    data.extend_from_slice(SIGNATURE_PREFIX);
    data.extend_from_slice(signed_content);
    data
}

/// Sign with our Ed25519 key
pub fn sign(key: &SigningKey, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
    key.sign(data).to_bytes()
}

/// Verify a detached signature.
///
/// Uses strict verification: non-canonical encodings and small-order keys
/// are rejected. Any failure is [`CryptoError::BadSignature`] except a
/// malformed key or signature length.
pub fn verify(public: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let public: [u8; PUBLIC_KEY_SIZE] =
        public.try_into().map_err(|_| CryptoError::InvalidLength {
            what: "Ed25519 public key",
            expected: PUBLIC_KEY_SIZE,
            actual: public.len(),
        })?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidLength {
        what: "signature",
        expected: SIGNATURE_SIZE,
        actual: signature.len(),
    })?;
    let verifying =
        VerifyingKey::from_bytes(&public).map_err(|_| CryptoError::InvalidPublicKey("Ed25519"))?;

    verifying.verify_strict(data, &signature).map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&[5u8; 32])
    }

    #[test]
    fn signing_data_layout() {
        let data = signing_data(3, 1, &SendKey::new([0xAA; 16]), b"body");
        assert!(data.starts_with(SIGNATURE_PREFIX));
        assert_eq!(data[16], 3);
        assert_eq!(data[17], 1);
        assert_eq!(&data[18..34], &[0xAA; 16]);
        assert_eq!(&data[34..], b"body");
    }

    #[test]
    fn sign_then_verify() {
        let key = signer();
        let data = signing_data(3, 1, &SendKey::new([1; 16]), b"hello");
        let sig = sign(&key, &data);

        assert!(verify(key.verifying_key().as_bytes(), &data, &sig).is_ok());
    }

    #[test]
    fn substituted_key_fails() {
        let key = signer();
        let sig = sign(&key, &signing_data(3, 1, &SendKey::new([1; 16]), b"hello"));
        let forged = signing_data(3, 1, &SendKey::new([2; 16]), b"hello");

        assert_eq!(
            verify(key.verifying_key().as_bytes(), &forged, &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn wrong_signer_fails() {
        let data = legacy_signing_data(b"hello");
        let sig = sign(&signer(), &data);
        let other = SigningKey::from_bytes(&[6u8; 32]);

        assert_eq!(
            verify(other.verifying_key().as_bytes(), &data, &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn malformed_inputs_are_length_errors() {
        let key = signer();
        assert!(matches!(
            verify(&[0; 31], b"x", &[0; 64]),
            Err(CryptoError::InvalidLength { .. })
        ));
        assert!(matches!(
            verify(key.verifying_key().as_bytes(), b"x", &[0; 63]),
            Err(CryptoError::InvalidLength { .. })
        ));
    }
}
