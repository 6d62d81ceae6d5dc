//! Strongvelope Cryptographic Primitives
//!
//! Pure functions over caller-supplied keys and nonces. Nothing here does
//! I/O. The only randomness drawn is the blinding factor of RSA unwrap,
//! which does not affect its result, so every operation is deterministic
//! under test.
//!
//! # Key Hierarchy
//!
//! ```text
//! Curve25519 (ours) × Curve25519 (peer)
//!        │
//!        ▼
//! X25519 → HKDF-SHA256 → Pairwise Key (per peer, cached)
//!        │
//!        ▼
//! AES-128-ECB wrap → Send Key (per chat, per owner, rotating)
//!        │
//!        ▼
//! HMAC-SHA256(send key, master nonce) → IV → AES-128-CTR → Payload
//! ```
//!
//! Recipients without a Curve25519 key get the send key wrapped with RSA
//! instead. Wrapped keys of either scheme are told apart by length.
//!
//! # Security
//!
//! Authenticity:
//! - The payload cipher is unauthenticated CTR; the Ed25519 envelope
//!   signature is the integrity check and must be verified before decrypting
//! - The signed data includes the send key, so a signature cannot be reused
//!   with a substituted key
//!
//! Key hygiene:
//! - [`SendKey`] and [`PairwiseKey`] zero their bytes on drop and redact
//!   `Debug` output
//! - Low-order Curve25519 peer keys are rejected

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backend;
pub mod error;
pub mod keys;
pub mod pairwise;
pub mod payload;
pub mod signing;
pub mod wrap;

pub use backend::{CryptoBackend, IdentityBackend, RecipientKey};
pub use error::{CryptoError, Result};
pub use keys::{
    Identity, MASTER_NONCE_SIZE, MasterNonce, PUBLIC_KEY_SIZE, PairwiseKey, PublicIdentity,
    SEND_KEY_SIZE, SendKey,
};
pub use signing::{SIGNATURE_PREFIX, SIGNATURE_SIZE, legacy_signing_data, signing_data};
pub use wrap::{RSA_WRAP_THRESHOLD, WrapScheme, decode_rsa_public, encode_rsa_public};

/// Re-exported so callers can hold RSA keys without depending on `rsa`
pub use rsa::{RsaPrivateKey, RsaPublicKey};
