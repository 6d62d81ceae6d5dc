//! Persistent key cache collaborator.
//!
//! Only the read/write contract lives here. The store writes every key it
//! learns and reads them all back once, before any network activity.

use strongvelope_crypto::SendKey;
use strongvelope_proto::{ChatId, KeyId, UserId};
use thiserror::Error;

/// One cached send key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedKey {
    /// User that created the key
    pub owner: UserId,
    /// Server-assigned id
    pub key_id: KeyId,
    /// Key bytes
    pub key: SendKey,
}

/// Cache backend failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Storage could not be read or written
    #[error("key cache unavailable: {0}")]
    Unavailable(String),
}

/// Storage of confirmed send keys, keyed by (chat, owner, key id).
///
/// Methods take `&self`; implementations use interior mutability since the
/// cache is shared by every chat of a session.
pub trait KeyCache: 'static {
    /// Store a key, replacing any entry with the same id
    fn put(&self, chat: ChatId, key: &CachedKey) -> Result<(), CacheError>;

    /// Every key stored for a chat
    fn load_all(&self, chat: ChatId) -> Result<Vec<CachedKey>, CacheError>;

    /// Forget a key. Missing entries are not an error.
    fn remove(&self, chat: ChatId, owner: UserId, key_id: KeyId) -> Result<(), CacheError>;
}
