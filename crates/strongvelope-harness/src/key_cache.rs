//! In-memory key cache.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
};

use strongvelope_client::{CacheError, CachedKey, KeyCache};
use strongvelope_crypto::SendKey;
use strongvelope_proto::{ChatId, KeyId, UserId};

/// Key cache that survives handler restarts within one test.
#[derive(Default)]
pub struct MemoryKeyCache {
    entries: RefCell<BTreeMap<(ChatId, UserId, KeyId), SendKey>>,
    unavailable: Cell<bool>,
}

impl MemoryKeyCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail while `unavailable` is set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.set(unavailable);
    }

    /// Stored key, if any
    pub fn get(&self, chat: ChatId, owner: UserId, key_id: KeyId) -> Option<SendKey> {
        self.entries.borrow().get(&(chat, owner, key_id)).cloned()
    }

    /// Number of stored keys across all chats
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.get() {
            return Err(CacheError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

impl KeyCache for MemoryKeyCache {
    fn put(&self, chat: ChatId, key: &CachedKey) -> Result<(), CacheError> {
        self.check()?;
        self.entries.borrow_mut().insert((chat, key.owner, key.key_id), key.key.clone());
        Ok(())
    }

    fn load_all(&self, chat: ChatId) -> Result<Vec<CachedKey>, CacheError> {
        self.check()?;
        Ok(self
            .entries
            .borrow()
            .range((chat, UserId(0), KeyId(0))..=(chat, UserId(u64::MAX), KeyId(u32::MAX)))
            .map(|(&(_, owner, key_id), key)| CachedKey { owner, key_id, key: key.clone() })
            .collect())
    }

    fn remove(&self, chat: ChatId, owner: UserId, key_id: KeyId) -> Result<(), CacheError> {
        self.check()?;
        self.entries.borrow_mut().remove(&(chat, owner, key_id));
        Ok(())
    }
}
