//! Key material types.
//!
//! Symmetric keys are fixed-size newtypes that zero their bytes on drop and
//! never print their contents.

use std::fmt;

use ed25519_dalek::SigningKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};

/// Send key size (AES-128)
pub const SEND_KEY_SIZE: usize = 16;

/// Master nonce size carried in the envelope
pub const MASTER_NONCE_SIZE: usize = 12;

/// Curve25519 and Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Random 12-byte nonce from which the payload IV is derived
pub type MasterNonce = [u8; MASTER_NONCE_SIZE];

macro_rules! secret_key16 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name([u8; SEND_KEY_SIZE]);

        impl $name {
            /// Wrap raw key bytes
            pub const fn new(bytes: [u8; SEND_KEY_SIZE]) -> Self {
                Self(bytes)
            }

            /// Copy key bytes out of a slice that must be exactly 16 bytes
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let bytes: [u8; SEND_KEY_SIZE] =
                    bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                        what: stringify!($name),
                        expected: SEND_KEY_SIZE,
                        actual: bytes.len(),
                    })?;
                Ok(Self(bytes))
            }

            /// Raw key bytes
            pub const fn as_bytes(&self) -> &[u8; SEND_KEY_SIZE] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }
    };
}

secret_key16! {
    /// Per-chat, per-owner symmetric key that encrypts message payloads.
    ///
    /// The byte value never changes once created; the key store hands out
    /// clones and the clones zero themselves independently.
    SendKey
}

secret_key16! {
    /// AES key shared by two users, derived from their Curve25519 keys.
    ///
    /// Only ever used to wrap and unwrap send keys.
    PairwiseKey
}

/// Long-term keys of the local user.
pub struct Identity {
    x25519: StaticSecret,
    ed25519: SigningKey,
    rsa: Option<RsaPrivateKey>,
}

impl Identity {
    /// Build from 32-byte seeds for the Curve25519 and Ed25519 keys.
    pub fn from_seeds(x25519_seed: [u8; 32], ed25519_seed: [u8; 32]) -> Self {
        Self {
            x25519: StaticSecret::from(x25519_seed),
            ed25519: SigningKey::from_bytes(&ed25519_seed),
            rsa: None,
        }
    }

    /// Attach the legacy RSA key used to unwrap RSA-wrapped send keys
    #[must_use]
    pub fn with_rsa(mut self, key: RsaPrivateKey) -> Self {
        self.rsa = Some(key);
        self
    }

    /// Public halves, as published in the key directory
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            cu25519: X25519Public::from(&self.x25519).to_bytes(),
            ed25519: self.ed25519.verifying_key().to_bytes(),
            rsa: self.rsa.as_ref().map(RsaPublicKey::from),
        }
    }

    pub(crate) fn x25519(&self) -> &StaticSecret {
        &self.x25519
    }

    pub(crate) fn ed25519(&self) -> &SigningKey {
        &self.ed25519
    }

    pub(crate) fn rsa(&self) -> Option<&RsaPrivateKey> {
        self.rsa.as_ref()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("ed25519", &hex_prefix(self.ed25519.verifying_key().as_bytes()))
            .field("rsa", &self.rsa.is_some())
            .finish_non_exhaustive()
    }
}

/// Public keys of one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    /// Curve25519 key for pairwise key agreement
    pub cu25519: [u8; PUBLIC_KEY_SIZE],
    /// Ed25519 key that verifies the user's signatures
    pub ed25519: [u8; PUBLIC_KEY_SIZE],
    /// Legacy RSA key, if the user has one
    pub rsa: Option<RsaPublicKey>,
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}
