//! Wrapping send keys for individual recipients.
//!
//! Two schemes share one output slot, told apart by length:
//!
//! - Symmetric: AES-128-ECB of the 16-byte send key under the pairwise key.
//!   The wrapped key is exactly one block.
//! - RSA: textbook RSA of `len(2) ++ key(16)` zero-padded to the modulus
//!   size. The wrapped key is as long as the modulus, at least
//!   [`RSA_WRAP_THRESHOLD`] bytes.

use aes::{
    Aes128, Block,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit},
};
use rand::rngs::OsRng;
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    hazmat::{rsa_decrypt_and_check, rsa_encrypt},
    traits::PublicKeyParts,
};

use crate::{
    error::{CryptoError, Result},
    keys::{PairwiseKey, SEND_KEY_SIZE, SendKey},
};

/// Wrapped keys at least this long are RSA-wrapped
pub const RSA_WRAP_THRESHOLD: usize = 128;

/// Scheme of a wrapped key, derived from its length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapScheme {
    /// Single AES block under the pairwise key
    Symmetric,
    /// RSA under the recipient's public key
    Rsa,
}

impl WrapScheme {
    /// Classify a wrapped key
    pub fn of(wrapped: &[u8]) -> Self {
        if wrapped.len() < RSA_WRAP_THRESHOLD { Self::Symmetric } else { Self::Rsa }
    }
}

/// Wrap a send key under a pairwise key
pub fn wrap_symmetric(pairwise: &PairwiseKey, key: &SendKey) -> Vec<u8> {
    let cipher = Aes128::new(pairwise.as_bytes().into());
    let mut block = Block::clone_from_slice(key.as_bytes());
    cipher.encrypt_block(&mut block);
    block.to_vec()
}

/// Unwrap a symmetrically wrapped send key.
///
/// The input must be exactly one AES block.
pub fn unwrap_symmetric(pairwise: &PairwiseKey, wrapped: &[u8]) -> Result<SendKey> {
    if wrapped.len() != SEND_KEY_SIZE {
        return Err(CryptoError::InvalidLength {
            what: "symmetric wrapped key",
            expected: SEND_KEY_SIZE,
            actual: wrapped.len(),
        });
    }

    let cipher = Aes128::new(pairwise.as_bytes().into());
    let mut block = Block::clone_from_slice(wrapped);
    cipher.decrypt_block(&mut block);
    let Ok(bytes) = <[u8; SEND_KEY_SIZE]>::try_from(block.as_slice()) else {
        unreachable!("AES block is 16 bytes");
    };
    Ok(SendKey::new(bytes))
}

/// Wrap a send key under an RSA public key.
///
/// # Security
///
/// This is unpadded RSA kept for interoperability with recipients that have
/// no Curve25519 key. The plaintext has a fixed structure, so the output is
/// deterministic for a given key pair.
pub fn wrap_rsa(public: &RsaPublicKey, key: &SendKey) -> Result<Vec<u8>> {
    let size = public.size();
    if size < RSA_WRAP_THRESHOLD {
        return Err(CryptoError::RsaKeyTooSmall { bits: public.n().bits() });
    }

    // len_hi len_lo key(16) zeros; the leading zero byte of the length keeps
    // m below n for any modulus with the top bit set
    let mut plain = vec![0u8; size];
    plain[..2].copy_from_slice(&(SEND_KEY_SIZE as u16).to_be_bytes());
    plain[2..2 + SEND_KEY_SIZE].copy_from_slice(key.as_bytes());

    let m = BigUint::from_bytes_be(&plain);
    if &m >= public.n() {
        return Err(CryptoError::RsaCiphertextOutOfRange);
    }
    let c = rsa_encrypt(public, &m).map_err(|_| CryptoError::RsaCiphertextOutOfRange)?;
    Ok(left_pad(&c.to_bytes_be(), size))
}

/// Unwrap an RSA-wrapped send key with our private key.
///
/// The private-key operation is blinded with OS randomness, so its timing
/// does not depend on the ciphertext.
pub fn unwrap_rsa(private: &RsaPrivateKey, wrapped: &[u8]) -> Result<SendKey> {
    let size = private.size();
    if wrapped.len() != size {
        return Err(CryptoError::InvalidLength {
            what: "RSA wrapped key",
            expected: size,
            actual: wrapped.len(),
        });
    }

    let c = BigUint::from_bytes_be(wrapped);
    if &c >= private.n() {
        return Err(CryptoError::RsaCiphertextOutOfRange);
    }
    let m = rsa_decrypt_and_check(private, Some(&mut OsRng), &c)
        .map_err(|_| CryptoError::RsaDecryption)?;
    let plain = left_pad(&m.to_bytes_be(), size);

    let len = u16::from_be_bytes([plain[0], plain[1]]);
    if usize::from(len) != SEND_KEY_SIZE {
        return Err(CryptoError::RsaBadLengthPrefix(len));
    }
    SendKey::from_slice(&plain[2..2 + SEND_KEY_SIZE])
}

fn left_pad(bytes: &[u8], size: usize) -> Vec<u8> {
    debug_assert!(bytes.len() <= size);
    let mut out = vec![0u8; size - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

/// Encode an RSA public key for transport: modulus then exponent, each as a
/// 16-bit big-endian bit count followed by the big-endian magnitude.
pub fn encode_rsa_public(key: &RsaPublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.size() + 8);
    for part in [key.n(), key.e()] {
        out.extend_from_slice(&(part.bits() as u16).to_be_bytes());
        out.extend_from_slice(&part.to_bytes_be());
    }
    out
}

/// Decode an RSA public key written by [`encode_rsa_public`]
pub fn decode_rsa_public(mut bytes: &[u8]) -> Result<RsaPublicKey> {
    let n = read_mpi(&mut bytes)?;
    let e = read_mpi(&mut bytes)?;
    if !bytes.is_empty() {
        return Err(CryptoError::InvalidPublicKey("RSA"));
    }
    RsaPublicKey::new(n, e).map_err(|_| CryptoError::InvalidPublicKey("RSA"))
}

fn read_mpi(bytes: &mut &[u8]) -> Result<BigUint> {
    let Some((bits, rest)) = bytes.split_first_chunk::<2>() else {
        return Err(CryptoError::InvalidPublicKey("RSA"));
    };
    let len = usize::from(u16::from_be_bytes(*bits)).div_ceil(8);
    if rest.len() < len {
        return Err(CryptoError::InvalidPublicKey("RSA"));
    }
    let (value, rest) = rest.split_at(len);
    *bytes = rest;
    Ok(BigUint::from_bytes_be(value))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn rsa_key() -> RsaPrivateKey {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
        let Ok(key) = RsaPrivateKey::new(&mut rng, 1024) else {
            unreachable!("1024-bit generation succeeds");
        };
        key
    }

    #[test]
    fn symmetric_round_trip() {
        let pairwise = PairwiseKey::new([3; 16]);
        let key = SendKey::new([0x42; 16]);

        let wrapped = wrap_symmetric(&pairwise, &key);
        assert_eq!(wrapped.len(), 16);
        assert_eq!(WrapScheme::of(&wrapped), WrapScheme::Symmetric);
        assert_ne!(wrapped.as_slice(), key.as_bytes());
        assert_eq!(unwrap_symmetric(&pairwise, &wrapped).unwrap(), key);
    }

    #[test]
    fn symmetric_rejects_wrong_length() {
        let pairwise = PairwiseKey::new([3; 16]);
        assert!(unwrap_symmetric(&pairwise, &[0; 15]).is_err());
        assert!(unwrap_symmetric(&pairwise, &[0; 32]).is_err());
    }

    #[test]
    fn symmetric_wrong_pairwise_key_gives_different_key() {
        let key = SendKey::new([0x42; 16]);
        let wrapped = wrap_symmetric(&PairwiseKey::new([3; 16]), &key);
        assert_ne!(unwrap_symmetric(&PairwiseKey::new([4; 16]), &wrapped).unwrap(), key);
    }

    #[test]
    fn rsa_round_trip() {
        let private = rsa_key();
        let public = RsaPublicKey::from(&private);
        let key = SendKey::new([0x17; 16]);

        let wrapped = wrap_rsa(&public, &key).unwrap();
        assert_eq!(wrapped.len(), 128);
        assert_eq!(WrapScheme::of(&wrapped), WrapScheme::Rsa);
        assert_eq!(unwrap_rsa(&private, &wrapped).unwrap(), key);
    }

    #[test]
    fn rsa_unwrap_matches_textbook_exponentiation() {
        // blinded CRT decryption recovers exactly m = c^d mod n
        let private = rsa_key();
        let public = RsaPublicKey::from(&private);
        let key = SendKey::new([0x5A; 16]);
        let wrapped = wrap_rsa(&public, &key).unwrap();

        let c = BigUint::from_bytes_be(&wrapped);
        assert_eq!(c, {
            let mut plain = vec![0u8; 128];
            plain[..2].copy_from_slice(&16u16.to_be_bytes());
            plain[2..18].copy_from_slice(key.as_bytes());
            BigUint::from_bytes_be(&plain).modpow(public.e(), public.n())
        });
        for _ in 0..4 {
            assert_eq!(unwrap_rsa(&private, &wrapped).unwrap(), key);
        }
    }

    #[test]
    fn rsa_rejects_tampered_ciphertext() {
        let private = rsa_key();
        let public = RsaPublicKey::from(&private);
        let mut wrapped = wrap_rsa(&public, &SendKey::new([0x17; 16])).unwrap();
        wrapped[100] ^= 0x01;

        // the length prefix is garbage with overwhelming probability
        assert!(unwrap_rsa(&private, &wrapped).is_err());
    }

    #[test]
    fn rsa_rejects_out_of_range_ciphertext() {
        let private = rsa_key();
        assert_eq!(
            unwrap_rsa(&private, &[0xFF; 128]).unwrap_err(),
            CryptoError::RsaCiphertextOutOfRange
        );
    }

    #[test]
    fn rsa_public_key_transport() {
        let public = RsaPublicKey::from(&rsa_key());
        let encoded = encode_rsa_public(&public);

        assert_eq!(decode_rsa_public(&encoded).unwrap(), public);
        assert!(decode_rsa_public(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode_rsa_public(&[]).is_err());
    }
}
