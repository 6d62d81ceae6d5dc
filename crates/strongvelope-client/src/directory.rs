//! Public-key directory collaborator.

use std::{fmt, future::Future};

use strongvelope_proto::UserId;
use thiserror::Error;

/// Kind of public key published per user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicKeyKind {
    /// 32-byte Curve25519 key for pairwise key agreement
    Cu25519,
    /// 32-byte Ed25519 key that verifies signatures
    Ed25519,
    /// RSA key in MPI transport form (see `strongvelope_crypto::encode_rsa_public`)
    Rsa,
}

impl fmt::Display for PublicKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cu25519 => "Cu25519",
            Self::Ed25519 => "Ed25519",
            Self::Rsa => "RSA",
        })
    }
}

/// Directory lookup failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The user has no key of this kind. Permanent.
    #[error("user {user} has no {kind} key")]
    NotFound {
        /// User looked up
        user: UserId,
        /// Kind requested
        kind: PublicKeyKind,
    },

    /// Lookup did not complete. Retrying upstream may succeed.
    #[error("directory lookup failed: {0}")]
    Network(String),
}

impl DirectoryError {
    /// Whether the key definitely does not exist
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Async lookup of users' public keys.
///
/// Implementations cache upstream and must tolerate repeated calls for the
/// same key. The returned future runs on the caller's thread and need not be
/// `Send`.
pub trait PublicKeyDirectory: 'static {
    /// Fetch one public key
    fn public_key(
        &self,
        user: UserId,
        kind: PublicKeyKind,
    ) -> impl Future<Output = Result<Vec<u8>, DirectoryError>>;
}
