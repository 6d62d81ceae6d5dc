//! Pairwise key agreement between two users.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::{CryptoError, Result},
    keys::{PUBLIC_KEY_SIZE, PairwiseKey, SEND_KEY_SIZE},
};

/// HKDF info string for pairwise key derivation
const PAIRWISE_INFO: &[u8] = b"strongvelope pairwise key";

/// Derive the AES key shared with a peer.
///
/// X25519 of our static secret and the peer's public key, then HKDF-SHA256
/// with an empty salt, truncated to 16 bytes.
///
/// # Security
///
/// - Symmetric: both sides derive the same key from their own secret
/// - Rejects low-order peer keys that would force an all-zero shared secret
/// - The key is a function of two long-term keys only, so callers cache it
pub fn derive_pairwise_key(own: &StaticSecret, peer_public: &[u8]) -> Result<PairwiseKey> {
    let peer: [u8; PUBLIC_KEY_SIZE] =
        peer_public.try_into().map_err(|_| CryptoError::InvalidLength {
            what: "Curve25519 public key",
            expected: PUBLIC_KEY_SIZE,
            actual: peer_public.len(),
        })?;

    let shared = own.diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; SEND_KEY_SIZE];
    let Ok(()) = hkdf.expand(PAIRWISE_INFO, &mut okm) else {
        unreachable!("16 bytes is a valid HKDF-SHA256 output length");
    };

    let key = PairwiseKey::new(okm);
    okm.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn public_of(secret: &StaticSecret) -> [u8; 32] {
        PublicKey::from(secret).to_bytes()
    }

    #[test]
    fn both_sides_derive_same_key() {
        let alice = StaticSecret::from([7u8; 32]);
        let bob = StaticSecret::from([9u8; 32]);

        let ab = derive_pairwise_key(&alice, &public_of(&bob)).unwrap();
        let ba = derive_pairwise_key(&bob, &public_of(&alice)).unwrap();

        assert_eq!(ab, ba);
    }

    #[test]
    fn different_peers_get_different_keys() {
        let alice = StaticSecret::from([7u8; 32]);
        let bob = StaticSecret::from([9u8; 32]);
        let carol = StaticSecret::from([11u8; 32]);

        assert_ne!(
            derive_pairwise_key(&alice, &public_of(&bob)).unwrap(),
            derive_pairwise_key(&alice, &public_of(&carol)).unwrap()
        );
    }

    #[test]
    fn low_order_point_rejected() {
        let alice = StaticSecret::from([7u8; 32]);
        assert_eq!(derive_pairwise_key(&alice, &[0u8; 32]), Err(CryptoError::NonContributory));
    }

    #[test]
    fn wrong_length_rejected() {
        let alice = StaticSecret::from([7u8; 32]);
        assert!(matches!(
            derive_pairwise_key(&alice, &[1u8; 31]),
            Err(CryptoError::InvalidLength { actual: 31, .. })
        ));
    }
}
