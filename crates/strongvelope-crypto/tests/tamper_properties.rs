//! Property-based tests for sign-then-encrypt as the handler composes it
//!
//! A sealed payload is `nonce ++ ciphertext`, signed over the key-bound
//! signing data. Flipping any bit of the signature, nonce or ciphertext must
//! make verification fail; it must never yield a different plaintext that
//! verifies.

use proptest::prelude::*;
use strongvelope_crypto::{
    CryptoBackend, Identity, IdentityBackend, MASTER_NONCE_SIZE, SendKey, signing_data,
};

struct Sealed {
    signature: [u8; 64],
    nonce: [u8; MASTER_NONCE_SIZE],
    ciphertext: Vec<u8>,
}

fn signed_content(nonce: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut content = nonce.to_vec();
    content.extend_from_slice(ciphertext);
    content
}

fn seal(
    backend: &IdentityBackend,
    key: &SendKey,
    nonce: [u8; MASTER_NONCE_SIZE],
    plaintext: &[u8],
) -> Sealed {
    let ciphertext = backend.encrypt_payload(key, &nonce, plaintext);
    let data = signing_data(3, 1, key, &signed_content(&nonce, &ciphertext));
    Sealed { signature: backend.sign(&data), nonce, ciphertext }
}

fn open(backend: &IdentityBackend, key: &SendKey, sealed: &Sealed) -> Option<Vec<u8>> {
    let data = signing_data(3, 1, key, &signed_content(&sealed.nonce, &sealed.ciphertext));
    backend.verify(&backend.public().ed25519, &data, &sealed.signature).ok()?;
    Some(backend.decrypt_payload(key, &sealed.nonce, &sealed.ciphertext))
}

fn backend() -> IdentityBackend {
    IdentityBackend::new(Identity::from_seeds([0x11; 32], [0x22; 32]))
}

#[test]
fn prop_round_trip() {
    let backend = backend();
    proptest!(|(
        key in any::<[u8; 16]>(),
        nonce in any::<[u8; 12]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
    )| {
        let key = SendKey::new(key);
        let sealed = seal(&backend, &key, nonce, &plaintext);

        // PROPERTY: decrypt(encrypt(P, K), K) == P
        prop_assert_eq!(open(&backend, &key, &sealed), Some(plaintext));
    });
}

#[test]
fn prop_single_bit_flip_detected() {
    let backend = backend();
    proptest!(|(
        key in any::<[u8; 16]>(),
        nonce in any::<[u8; 12]>(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        target in 0u8..3,
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    )| {
        let key = SendKey::new(key);
        let mut sealed = seal(&backend, &key, nonce, &plaintext);

        let field: &mut [u8] = match target {
            0 => &mut sealed.signature,
            1 => &mut sealed.nonce,
            _ => &mut sealed.ciphertext,
        };
        let at = position.index(field.len());
        field[at] ^= 1 << bit;

        // PROPERTY: tampering never produces an accepted plaintext
        prop_assert_eq!(open(&backend, &key, &sealed), None);
    });
}

#[test]
fn prop_wrong_key_rejected() {
    let backend = backend();
    proptest!(|(
        key in any::<[u8; 16]>(),
        other in any::<[u8; 16]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..64),
    )| {
        prop_assume!(key != other);
        let sealed = seal(&backend, &SendKey::new(key), [7; 12], &plaintext);

        // PROPERTY: the key is bound into the signature
        prop_assert_eq!(open(&backend, &SendKey::new(other), &sealed), None);
    });
}
