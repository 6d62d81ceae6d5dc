//! Pluggable crypto capability.
//!
//! The protocol handler only talks to [`CryptoBackend`]. [`IdentityBackend`]
//! is the production implementation over the local user's long-term keys;
//! tests may substitute a deterministic fake.

use rsa::RsaPublicKey;

use crate::{
    error::{CryptoError, Result},
    keys::{Identity, MasterNonce, PairwiseKey, PublicIdentity, SendKey},
    pairwise, payload, signing,
    wrap::{self, WrapScheme},
};

/// Public material a send key is wrapped under
#[derive(Debug, Clone, Copy)]
pub enum RecipientKey<'a> {
    /// Pairwise key derived from the recipient's Curve25519 key
    Pairwise(&'a PairwiseKey),
    /// Recipient's legacy RSA key
    Rsa(&'a RsaPublicKey),
}

/// Cryptographic operations used by the protocol handler.
pub trait CryptoBackend {
    /// Sign `data` with the local Ed25519 key
    fn sign(&self, data: &[u8]) -> [u8; signing::SIGNATURE_SIZE];

    /// Verify a signature by `public` over `data`
    fn verify(&self, public: &[u8], data: &[u8], signature: &[u8]) -> Result<()>;

    /// Encrypt a framed plaintext
    fn encrypt_payload(&self, key: &SendKey, nonce: &MasterNonce, plaintext: &[u8]) -> Vec<u8>;

    /// Decrypt a ciphertext produced by [`CryptoBackend::encrypt_payload`]
    fn decrypt_payload(&self, key: &SendKey, nonce: &MasterNonce, ciphertext: &[u8]) -> Vec<u8>;

    /// Derive the pairwise key shared with the owner of `peer_cu25519`
    fn pairwise_key(&self, peer_cu25519: &[u8]) -> Result<PairwiseKey>;

    /// Wrap a send key for one recipient
    fn wrap_key(&self, key: &SendKey, recipient: RecipientKey<'_>) -> Result<Vec<u8>>;

    /// Unwrap a send key addressed to us.
    ///
    /// The scheme is chosen by length. Symmetric unwrapping needs the
    /// pairwise key shared with the key's owner.
    fn unwrap_key(&self, wrapped: &[u8], pairwise: Option<&PairwiseKey>) -> Result<SendKey>;
}

/// [`CryptoBackend`] over the local user's [`Identity`]
#[derive(Debug)]
pub struct IdentityBackend {
    identity: Identity,
    public: PublicIdentity,
}

impl IdentityBackend {
    /// Create a backend owning `identity`
    pub fn new(identity: Identity) -> Self {
        let public = identity.public();
        Self { identity, public }
    }

    /// Our public keys
    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }
}

impl CryptoBackend for IdentityBackend {
    fn sign(&self, data: &[u8]) -> [u8; signing::SIGNATURE_SIZE] {
        signing::sign(self.identity.ed25519(), data)
    }

    fn verify(&self, public: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
        signing::verify(public, data, signature)
    }

    fn encrypt_payload(&self, key: &SendKey, nonce: &MasterNonce, plaintext: &[u8]) -> Vec<u8> {
        payload::encrypt_payload(key, nonce, plaintext)
    }

    fn decrypt_payload(&self, key: &SendKey, nonce: &MasterNonce, ciphertext: &[u8]) -> Vec<u8> {
        payload::decrypt_payload(key, nonce, ciphertext)
    }

    fn pairwise_key(&self, peer_cu25519: &[u8]) -> Result<PairwiseKey> {
        pairwise::derive_pairwise_key(self.identity.x25519(), peer_cu25519)
    }

    fn wrap_key(&self, key: &SendKey, recipient: RecipientKey<'_>) -> Result<Vec<u8>> {
        match recipient {
            RecipientKey::Pairwise(pairwise) => Ok(wrap::wrap_symmetric(pairwise, key)),
            RecipientKey::Rsa(public) => wrap::wrap_rsa(public, key),
        }
    }

    fn unwrap_key(&self, wrapped: &[u8], pairwise: Option<&PairwiseKey>) -> Result<SendKey> {
        match WrapScheme::of(wrapped) {
            WrapScheme::Symmetric => {
                let pairwise = pairwise.ok_or(CryptoError::MissingPairwiseKey)?;
                wrap::unwrap_symmetric(pairwise, wrapped)
            },
            WrapScheme::Rsa => {
                let private = self.identity.rsa().ok_or(CryptoError::NoRsaKey)?;
                wrap::unwrap_rsa(private, wrapped)
            },
        }
    }
}
