//! Payload cipher: AES-128-CTR with an IV derived from the master nonce.

use aes::Aes128;
use ctr::{
    Ctr32BE,
    cipher::{KeyIvInit, StreamCipher},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::{MasterNonce, SendKey};

type HmacSha256 = Hmac<Sha256>;
type Aes128Ctr = Ctr32BE<Aes128>;

/// Context string mixed into the IV derivation for message payloads
const PAYLOAD_CONTEXT: &[u8] = b"payload";

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Derive the CTR-mode initial counter block for one message.
///
/// `HMAC-SHA256(send_key, "payload" ++ master_nonce)` truncated to 16 bytes,
/// with the last four bytes zeroed as the block counter.
pub fn derive_payload_iv(key: &SendKey, nonce: &MasterNonce) -> [u8; BLOCK_SIZE] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(PAYLOAD_CONTEXT);
    mac.update(nonce);
    let digest = mac.finalize().into_bytes();

    let mut iv = [0u8; BLOCK_SIZE];
    iv[..12].copy_from_slice(&digest[..12]);
    iv
}

/// Encrypt (or decrypt) a payload in place.
///
/// CTR mode is its own inverse, so the same call serves both directions.
pub fn apply_payload_cipher(key: &SendKey, nonce: &MasterNonce, data: &mut [u8]) {
    let iv = derive_payload_iv(key, nonce);
    let mut cipher = Aes128Ctr::new(key.as_bytes().into(), &iv.into());
    cipher.apply_keystream(data);
}

/// Encrypt a payload, returning the ciphertext
pub fn encrypt_payload(key: &SendKey, nonce: &MasterNonce, plaintext: &[u8]) -> Vec<u8> {
    let mut out = plaintext.to_vec();
    apply_payload_cipher(key, nonce, &mut out);
    out
}

/// Decrypt a payload, returning the plaintext.
///
/// CTR has no authentication tag; integrity comes from the envelope
/// signature, which must be verified first.
pub fn decrypt_payload(key: &SendKey, nonce: &MasterNonce, ciphertext: &[u8]) -> Vec<u8> {
    encrypt_payload(key, nonce, ciphertext)
}
