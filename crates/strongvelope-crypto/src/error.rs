//! Cryptographic error types.

use thiserror::Error;

/// Result alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors from the cryptographic primitives.
///
/// None of these is transient: the same inputs fail the same way every time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material of the wrong size
    #[error("{what} must be {expected} bytes, got {actual}")]
    InvalidLength {
        /// Which input was wrong
        what: &'static str,
        /// Required size
        expected: usize,
        /// Size supplied
        actual: usize,
    },

    /// Public key bytes do not decode
    #[error("invalid {0} public key")]
    InvalidPublicKey(&'static str),

    /// ECDH produced the all-zero secret (peer sent a low-order point)
    #[error("key agreement with a low-order point")]
    NonContributory,

    /// Signature did not verify
    #[error("signature verification failed")]
    BadSignature,

    /// Symmetric unwrap requested without a pairwise key
    #[error("symmetric unwrap needs a pairwise key")]
    MissingPairwiseKey,

    /// RSA unwrap requested but no RSA private key is held
    #[error("no RSA private key available")]
    NoRsaKey,

    /// RSA modulus too small to carry a wrapped key
    #[error("RSA modulus of {bits} bits is too small")]
    RsaKeyTooSmall {
        /// Modulus size
        bits: usize,
    },

    /// RSA ciphertext is not a valid residue for the key
    #[error("RSA ciphertext out of range")]
    RsaCiphertextOutOfRange,

    /// RSA private-key operation failed its consistency check
    #[error("RSA decryption failed")]
    RsaDecryption,

    /// RSA plaintext does not carry a 16-byte key
    #[error("RSA-wrapped key has length prefix {0}")]
    RsaBadLengthPrefix(u16),
}
