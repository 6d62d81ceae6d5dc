//! Client error types and their mapping onto message status.

use strongvelope_crypto::CryptoError;
use strongvelope_proto::{EncryptionStatus, KeyId, MessageError, ProtocolError, UserId};
use thiserror::Error;

use crate::{directory::DirectoryError, key_cache::CacheError};

/// Result alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors from the key store and protocol handler.
///
/// On the decrypt path these never escape the handler: they are folded into
/// the message's [`EncryptionStatus`] by [`ClientError::encryption_status`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Wire framing or envelope structure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Public key lookup
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Key cache access
    #[error("key cache error: {0}")]
    Cache(#[from] CacheError),

    /// Message entity rule
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Confirmation arrived with no unconfirmed key outstanding
    #[error("no unconfirmed key to confirm")]
    NoUnconfirmedKey,

    /// Key id that cannot take the requested role
    #[error("key id {0} is not valid here")]
    InvalidKeyId(KeyId),

    /// Same (owner, key id) already maps to a different key
    #[error("key {key_id} of {owner} already holds a different value")]
    KeyMismatch {
        /// Key owner
        owner: UserId,
        /// Key id
        key_id: KeyId,
    },

    /// A key command carried no entry for the local user
    #[error("key {key_id} of {owner} has no entry for us")]
    NotARecipient {
        /// Key owner
        owner: UserId,
        /// Key id
        key_id: KeyId,
    },

    /// Our own key is referenced but not held
    #[error("own key {0} is unknown")]
    UnknownOwnKey(KeyId),

    /// Waiting for a key was abandoned because its store was dropped
    #[error("key wait abandoned")]
    Abandoned,

    /// Envelope type this client does not know
    #[error("unknown management type {0:#04x}")]
    UnknownManagementType(u8),

    /// Legacy message type that carried inline wrapped keys
    #[error("legacy keyed messages are not supported")]
    LegacyKeyedMessage,
}

impl ClientError {
    /// Returns true if a later retry may succeed.
    ///
    /// Transient errors wait on something outside this message: a key not
    /// yet received, a directory that was unreachable, or a client update.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Directory(e) => !e.is_permanent(),
            Self::Abandoned | Self::UnknownManagementType(_) | Self::Cache(_) => true,
            _ => false,
        }
    }

    /// Status to record on a message that failed with this error
    pub fn encryption_status(&self) -> EncryptionStatus {
        match self {
            Self::Protocol(_) | Self::Message(_) | Self::LegacyKeyedMessage => {
                EncryptionStatus::Malformed
            },
            Self::Crypto(CryptoError::BadSignature) => EncryptionStatus::BadSignature,
            Self::UnknownManagementType(_) => EncryptionStatus::UnknownType,
            Self::Directory(e) if !e.is_permanent() => EncryptionStatus::Pending,
            Self::Abandoned | Self::Cache(_) => EncryptionStatus::Pending,
            Self::Crypto(_)
            | Self::Directory(_)
            | Self::NoUnconfirmedKey
            | Self::InvalidKeyId(_)
            | Self::KeyMismatch { .. }
            | Self::NotARecipient { .. }
            | Self::UnknownOwnKey(_) => EncryptionStatus::NoKey,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PublicKeyKind;

    #[test]
    fn status_follows_taxonomy() {
        let cases = [
            (ClientError::Protocol(ProtocolError::EmptyEnvelope), EncryptionStatus::Malformed),
            (ClientError::Crypto(CryptoError::BadSignature), EncryptionStatus::BadSignature),
            (ClientError::Crypto(CryptoError::NoRsaKey), EncryptionStatus::NoKey),
            (ClientError::UnknownManagementType(0x42), EncryptionStatus::UnknownType),
            (ClientError::Directory(DirectoryError::Network("down".into())), EncryptionStatus::Pending),
            (
                ClientError::Directory(DirectoryError::NotFound {
                    user: UserId(1),
                    kind: PublicKeyKind::Ed25519,
                }),
                EncryptionStatus::NoKey,
            ),
            (ClientError::Abandoned, EncryptionStatus::Pending),
        ];

        for (error, status) in cases {
            assert_eq!(error.encryption_status(), status, "{error}");
            // PROPERTY: transient errors never map to a permanent status
            if error.is_transient() {
                assert!(!status.is_permanent_failure(), "{error}");
            }
        }
    }

    #[test]
    fn permanent_failures_are_not_transient() {
        assert!(!ClientError::Crypto(CryptoError::BadSignature).is_transient());
        assert!(!ClientError::Protocol(ProtocolError::EmptyEnvelope).is_transient());
        assert!(ClientError::UnknownManagementType(9).is_transient());
    }
}
