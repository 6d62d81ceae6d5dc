//! Per-chat send key store and rotation state machine.
//!
//! ```text
//! NoKey ──current_key──▶ Unconfirmed ──confirm──▶ Confirmed
//!                            ▲                       │
//!                            └──current_key── Stale ◀┘ participants changed
//! ```
//!
//! The unconfirmed key is orthogonal to the confirmed one: while it is
//! outstanding every new message reuses it, and a confirmed key that went
//! stale stays available for decrypting the history it encrypted.
//!
//! A membership change while the key is unconfirmed does not stop it from
//! being used. It is marked stale instead: confirmation reports the members
//! it never reached, and the next message after confirmation rotates.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    future::Future,
    iter,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use strongvelope_crypto::SendKey;
use strongvelope_proto::{ChatId, KeyId, UserId};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    directory::DirectoryError,
    env::Environment,
    error::{ClientError, Result},
    key_cache::{CachedKey, KeyCache},
};

type KeySender = oneshot::Sender<Result<SendKey>>;

enum KeyEntry {
    Ready(SendKey),
    /// Waiters for a key that has not been received yet
    Pending(Vec<KeySender>),
    /// Unwrap failed permanently; the error is replayed to later lookups
    Rejected(ClientError),
}

struct Unconfirmed {
    key: SendKey,
    /// Participants changed since the key was announced
    stale: bool,
    /// Recipients of the key command. `None` until one has been produced,
    /// or again after producing it failed.
    announced_to: Option<BTreeSet<UserId>>,
}

/// Key chosen for the next outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentKey {
    /// Already announced; no key command needed
    Existing {
        /// Confirmed id, or [`KeyId::UNCONFIRMED`] for the pending key
        key_id: KeyId,
        /// Key bytes
        key: SendKey,
    },
    /// Unconfirmed key with no key command yet, either freshly generated
    /// or left unannounced by a failed encrypt. Must be wrapped for
    /// `recipients` and announced before the message that uses it.
    Created {
        /// Key bytes
        key: SendKey,
        /// Participants and ourselves at the time of the announcement
        recipients: BTreeSet<UserId>,
    },
}

impl CurrentKey {
    /// Id the message is encrypted under
    pub fn key_id(&self) -> KeyId {
        match self {
            Self::Existing { key_id, .. } => *key_id,
            Self::Created { .. } => KeyId::UNCONFIRMED,
        }
    }

    /// Key bytes
    pub fn key(&self) -> &SendKey {
        match self {
            Self::Existing { key, .. } | Self::Created { key, .. } => key,
        }
    }
}

/// Rotation state, for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    /// No confirmed key for sending
    NoKey,
    /// Confirmed key usable for new messages
    Current(KeyId),
    /// Confirmed key exists but participants changed since
    Stale(KeyId),
}

/// Outcome of confirming the unconfirmed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    /// Key now stored under the assigned id
    pub key: SendKey,
    /// Participants that joined after the key was announced. They need a
    /// follow-up key command to read the messages it encrypted.
    pub unreached: BTreeSet<UserId>,
}

/// Result of looking up a key
pub enum KeyResolution {
    /// Key is held
    Ready(SendKey),
    /// Key will be available once its key command is unwrapped
    Pending(PendingKey),
}

/// Future resolving to a key that has not arrived yet.
///
/// Resolves to [`ClientError::Abandoned`] if the store is dropped first.
pub struct PendingKey {
    rx: oneshot::Receiver<Result<SendKey>>,
}

impl Future for PendingKey {
    type Output = Result<SendKey>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| received.unwrap_or(Err(ClientError::Abandoned)))
    }
}

/// Send keys of one chat, indexed by (owner, key id).
///
/// # Invariants
///
/// - At most one unconfirmed key exists at a time
/// - A key's bytes never change once stored under an id
/// - A confirmed id maps to one key per owner; conflicting adds are refused
pub struct KeyStore<C> {
    chat: ChatId,
    own: UserId,
    cache: Rc<C>,
    keys: HashMap<(UserId, KeyId), KeyEntry>,
    current: Option<KeyId>,
    stale: bool,
    unconfirmed: Option<Unconfirmed>,
    participants: BTreeSet<UserId>,
    unwrapping: HashSet<(UserId, KeyId)>,
}

impl<C: KeyCache> KeyStore<C> {
    /// Open the store for `chat`, pre-populated from the cache
    pub fn open(chat: ChatId, own: UserId, cache: Rc<C>) -> Result<Self> {
        let cached = cache.load_all(chat)?;
        let mut keys = HashMap::with_capacity(cached.len());
        for CachedKey { owner, key_id, key } in cached {
            keys.insert((owner, key_id), KeyEntry::Ready(key));
        }
        debug!(%chat, keys = keys.len(), "key store warm start");

        Ok(Self {
            chat,
            own,
            cache,
            keys,
            current: None,
            stale: false,
            unconfirmed: None,
            participants: BTreeSet::new(),
            unwrapping: HashSet::new(),
        })
    }

    /// Chat this store belongs to
    pub fn chat(&self) -> ChatId {
        self.chat
    }

    /// Rotation state of the confirmed key
    pub fn state(&self) -> RotationState {
        match self.current {
            None => RotationState::NoKey,
            Some(id) if self.stale => RotationState::Stale(id),
            Some(id) => RotationState::Current(id),
        }
    }

    /// Whether a key awaits confirmation
    pub fn has_unconfirmed(&self) -> bool {
        self.unconfirmed.is_some()
    }

    /// Key for the next outgoing message.
    ///
    /// Returns the current confirmed key unless participants changed since
    /// it was created. Otherwise reuses the unconfirmed key, or generates
    /// one. The unconfirmed key is reused even when participants changed
    /// after it was announced; [`confirm`](Self::confirm) then reports who
    /// it missed.
    pub fn current_key(&mut self, env: &impl Environment) -> CurrentKey {
        if let Some(key_id) = self.current
            && !self.stale
            && let Some(KeyEntry::Ready(key)) = self.keys.get(&(self.own, key_id))
        {
            return CurrentKey::Existing { key_id, key: key.clone() };
        }

        let recipients = self.recipients();
        if let Some(pending) = &mut self.unconfirmed {
            if pending.announced_to.is_some() {
                return CurrentKey::Existing { key_id: KeyId::UNCONFIRMED, key: pending.key.clone() };
            }
            // nobody holds it yet, so the current membership is all it needs
            pending.stale = false;
            pending.announced_to = Some(recipients.clone());
            debug!(chat = %self.chat, "announcing pending send key again");
            return CurrentKey::Created { key: pending.key.clone(), recipients };
        }

        let key = env.random_send_key();
        self.unconfirmed = Some(Unconfirmed {
            key: key.clone(),
            stale: false,
            announced_to: Some(recipients.clone()),
        });
        debug!(chat = %self.chat, previous = ?self.current, "generated send key");
        CurrentKey::Created { key, recipients }
    }

    /// Forget that the unconfirmed key `key` was announced, because its key
    /// command never left this client. The next
    /// [`current_key`](Self::current_key) announces it again.
    ///
    /// Does nothing if `key` is no longer the unconfirmed key.
    pub fn retract_announcement(&mut self, key: &SendKey) {
        if let Some(pending) = &mut self.unconfirmed
            && pending.key == *key
        {
            pending.announced_to = None;
            debug!(chat = %self.chat, "send key announcement withdrawn");
        }
    }

    /// Re-index the unconfirmed key under the id the server assigned.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyId` if `local` is not the unconfirmed sentinel or
    ///   `assigned` is not a server id
    /// - `NoUnconfirmedKey` if no key is outstanding
    /// - `KeyMismatch` if `assigned` already names a different own key
    pub fn confirm(&mut self, local: KeyId, assigned: KeyId) -> Result<Confirmed> {
        if !local.is_unconfirmed() {
            return Err(ClientError::InvalidKeyId(local));
        }
        if !assigned.is_confirmed() {
            return Err(ClientError::InvalidKeyId(assigned));
        }
        let Some(pending) = &self.unconfirmed else {
            return Err(ClientError::NoUnconfirmedKey);
        };
        let key = pending.key.clone();
        let stale = pending.stale;
        let unreached: BTreeSet<UserId> = match &pending.announced_to {
            Some(announced) => self.participants.difference(announced).copied().collect(),
            None => BTreeSet::new(),
        };

        self.store(self.own, assigned, key.clone())?;
        self.unconfirmed = None;
        self.current = Some(assigned);
        self.stale = stale;
        debug!(
            chat = %self.chat,
            key_id = %assigned,
            stale,
            unreached = unreached.len(),
            "send key confirmed"
        );
        Ok(Confirmed { key, unreached })
    }

    /// Key for `(owner, key_id)`, or a future for when it arrives.
    ///
    /// `(own, UNCONFIRMED)` resolves to the outstanding unconfirmed key, and
    /// fails at once with `InvalidKeyId` when none is outstanding. Lookups
    /// whose futures were all dropped are pruned before a new one is added.
    pub fn resolve(&mut self, owner: UserId, key_id: KeyId) -> KeyResolution {
        let (tx, rx) = oneshot::channel();
        let waiting = KeyResolution::Pending(PendingKey { rx });

        if owner == self.own && key_id.is_unconfirmed() {
            if let Some(pending) = &self.unconfirmed {
                return KeyResolution::Ready(pending.key.clone());
            }
            let _ = tx.send(Err(ClientError::InvalidKeyId(key_id)));
            return waiting;
        }

        match self.keys.get_mut(&(owner, key_id)) {
            Some(KeyEntry::Ready(key)) => return KeyResolution::Ready(key.clone()),
            Some(KeyEntry::Rejected(error)) => {
                let _ = tx.send(Err(error.clone()));
            },
            Some(KeyEntry::Pending(waiters)) => {
                waiters.retain(|waiter| !waiter.is_closed());
                waiters.push(tx);
            },
            None => {
                self.prune_abandoned();
                self.keys.insert((owner, key_id), KeyEntry::Pending(vec![tx]));
            },
        }
        waiting
    }

    fn prune_abandoned(&mut self) {
        let before = self.keys.len();
        self.keys.retain(|_, entry| match entry {
            KeyEntry::Pending(waiters) => {
                waiters.retain(|waiter| !waiter.is_closed());
                !waiters.is_empty()
            },
            KeyEntry::Ready(_) | KeyEntry::Rejected(_) => true,
        });
        let pruned = before - self.keys.len();
        if pruned > 0 {
            debug!(chat = %self.chat, pruned, "abandoned key lookups dropped");
        }
    }

    /// Held key, without waiting
    pub fn get(&self, owner: UserId, key_id: KeyId) -> Option<SendKey> {
        if owner == self.own && key_id.is_unconfirmed() {
            return self.unconfirmed.as_ref().map(|pending| pending.key.clone());
        }
        match self.keys.get(&(owner, key_id)) {
            Some(KeyEntry::Ready(key)) => Some(key.clone()),
            _ => None,
        }
    }

    /// Store a received key and wake everyone waiting for it.
    ///
    /// Adding the same value again is a no-op.
    pub fn add_key(&mut self, owner: UserId, key_id: KeyId, key: SendKey) -> Result<()> {
        self.unwrapping.remove(&(owner, key_id));
        self.store(owner, key_id, key)
    }

    /// Claim the unwrap of `(owner, key_id)`.
    ///
    /// Returns false if the key is held or another unwrap is in flight, so
    /// concurrent deliveries of one key command unwrap it once.
    pub fn begin_unwrap(&mut self, owner: UserId, key_id: KeyId) -> bool {
        if matches!(self.keys.get(&(owner, key_id)), Some(KeyEntry::Ready(_))) {
            return false;
        }
        self.unwrapping.insert((owner, key_id))
    }

    /// Release an unwrap claim after a transient failure; waiters keep waiting.
    pub fn abort_unwrap(&mut self, owner: UserId, key_id: KeyId) {
        self.unwrapping.remove(&(owner, key_id));
    }

    /// Record that `(owner, key_id)` can never be unwrapped.
    ///
    /// Waiters receive the error, as do later lookups. When the directory
    /// says the owner's key does not exist the cache entry is dropped too.
    pub fn reject(&mut self, owner: UserId, key_id: KeyId, error: ClientError) {
        self.unwrapping.remove(&(owner, key_id));
        if matches!(self.keys.get(&(owner, key_id)), Some(KeyEntry::Ready(_))) {
            return;
        }
        warn!(chat = %self.chat, %owner, %key_id, %error, "send key rejected");

        if matches!(error, ClientError::Directory(DirectoryError::NotFound { .. }))
            && let Err(e) = self.cache.remove(self.chat, owner, key_id)
        {
            warn!(chat = %self.chat, %owner, %key_id, error = %e, "key cache remove failed");
        }

        if let Some(KeyEntry::Pending(waiters)) =
            self.keys.insert((owner, key_id), KeyEntry::Rejected(error.clone()))
        {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Current participants
    pub fn participants(&self) -> &BTreeSet<UserId> {
        &self.participants
    }

    /// Everyone a new key is wrapped for: the participants and ourselves
    pub fn recipients(&self) -> BTreeSet<UserId> {
        self.participants.iter().copied().chain(iter::once(self.own)).collect()
    }

    /// Replace the participant set
    pub fn set_participants(&mut self, participants: impl IntoIterator<Item = UserId>) {
        let next: BTreeSet<UserId> = participants.into_iter().collect();
        if next != self.participants {
            self.participants = next;
            self.mark_stale();
        }
    }

    /// Add one participant
    pub fn add_participant(&mut self, user: UserId) {
        if self.participants.insert(user) {
            self.mark_stale();
        }
    }

    /// Remove one participant
    pub fn remove_participant(&mut self, user: UserId) {
        if self.participants.remove(&user) {
            self.mark_stale();
        }
    }

    fn mark_stale(&mut self) {
        if self.current.is_some() {
            self.stale = true;
        }
        if let Some(pending) = &mut self.unconfirmed {
            pending.stale = true;
        }
        debug!(chat = %self.chat, participants = self.participants.len(), "participants changed");
    }

    fn store(&mut self, owner: UserId, key_id: KeyId, key: SendKey) -> Result<()> {
        let previous = self.keys.remove(&(owner, key_id));
        if let Some(KeyEntry::Ready(existing)) = &previous
            && *existing != key
        {
            let existing = existing.clone();
            self.keys.insert((owner, key_id), KeyEntry::Ready(existing));
            return Err(ClientError::KeyMismatch { owner, key_id });
        }
        let already_held = matches!(previous, Some(KeyEntry::Ready(_)));

        if let Some(KeyEntry::Pending(waiters)) = previous {
            for waiter in waiters {
                let _ = waiter.send(Ok(key.clone()));
            }
        }
        if !already_held {
            let cached = CachedKey { owner, key_id, key: key.clone() };
            if let Err(e) = self.cache.put(self.chat, &cached) {
                warn!(chat = %self.chat, %owner, %key_id, error = %e, "key cache write failed");
            }
        }
        self.keys.insert((owner, key_id), KeyEntry::Ready(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use proptest::prelude::*;

    use super::*;
    use crate::key_cache::CacheError;

    #[derive(Clone, Default)]
    struct CountingEnv {
        counter: Rc<Cell<u8>>,
    }

    impl Environment for CountingEnv {
        fn random_bytes(&self, buffer: &mut [u8]) {
            let next = self.counter.get().wrapping_add(1);
            self.counter.set(next);
            buffer.fill(next);
        }
    }

    #[derive(Default)]
    struct VecCache {
        keys: RefCell<Vec<(ChatId, CachedKey)>>,
        removed: RefCell<Vec<(UserId, KeyId)>>,
    }

    impl KeyCache for VecCache {
        fn put(&self, chat: ChatId, key: &CachedKey) -> std::result::Result<(), CacheError> {
            self.keys.borrow_mut().push((chat, key.clone()));
            Ok(())
        }

        fn load_all(&self, chat: ChatId) -> std::result::Result<Vec<CachedKey>, CacheError> {
            Ok(self.keys.borrow().iter().filter(|(c, _)| *c == chat).map(|(_, k)| k.clone()).collect())
        }

        fn remove(
            &self,
            _chat: ChatId,
            owner: UserId,
            key_id: KeyId,
        ) -> std::result::Result<(), CacheError> {
            self.removed.borrow_mut().push((owner, key_id));
            Ok(())
        }
    }

    const ME: UserId = UserId(1);
    const PEER: UserId = UserId(2);

    fn store() -> (KeyStore<VecCache>, Rc<VecCache>) {
        let cache = Rc::new(VecCache::default());
        let store = KeyStore::open(ChatId(9), ME, Rc::clone(&cache)).unwrap();
        (store, cache)
    }

    #[test]
    fn first_key_is_created_then_reused_until_confirmed() {
        let (mut store, _) = store();
        let env = CountingEnv::default();

        let first = store.current_key(&env);
        assert!(matches!(first, CurrentKey::Created { .. }));
        assert_eq!(first.key_id(), KeyId::UNCONFIRMED);

        let second = store.current_key(&env);
        assert_eq!(second, CurrentKey::Existing { key_id: KeyId::UNCONFIRMED, key: first.key().clone() });
        assert_eq!(env.counter.get(), 1, "only one key generated");
    }

    #[test]
    fn confirm_makes_key_current_and_persists_it() {
        let (mut store, cache) = store();
        let env = CountingEnv::default();
        let created = store.current_key(&env);

        let confirmed = store.confirm(KeyId::UNCONFIRMED, KeyId(7)).unwrap();
        assert_eq!(&confirmed.key, created.key());
        assert!(confirmed.unreached.is_empty());
        assert_eq!(store.state(), RotationState::Current(KeyId(7)));
        assert!(!store.has_unconfirmed());
        assert_eq!(cache.keys.borrow().len(), 1);

        let next = store.current_key(&env);
        assert_eq!(next.key_id(), KeyId(7));
    }

    #[test]
    fn confirm_rejects_misuse() {
        let (mut store, _) = store();
        assert_eq!(store.confirm(KeyId::UNCONFIRMED, KeyId(7)), Err(ClientError::NoUnconfirmedKey));

        store.current_key(&CountingEnv::default());
        assert_eq!(
            store.confirm(KeyId::UNCONFIRMED, KeyId::UNCONFIRMED),
            Err(ClientError::InvalidKeyId(KeyId::UNCONFIRMED))
        );
        assert_eq!(
            store.confirm(KeyId(3), KeyId(7)),
            Err(ClientError::InvalidKeyId(KeyId(3)))
        );
        assert!(store.has_unconfirmed(), "failed confirm keeps the pending key");
    }

    #[test]
    fn confirmed_ids_stay_unique() {
        let (mut store, _) = store();
        let env = CountingEnv::default();

        store.current_key(&env);
        store.confirm(KeyId::UNCONFIRMED, KeyId(7)).unwrap();
        store.add_participant(PEER);
        store.current_key(&env);

        // PROPERTY: a second key never lands on an id already in use
        assert_eq!(
            store.confirm(KeyId::UNCONFIRMED, KeyId(7)),
            Err(ClientError::KeyMismatch { owner: ME, key_id: KeyId(7) })
        );
        assert!(store.confirm(KeyId::UNCONFIRMED, KeyId(8)).is_ok());
    }

    #[test]
    fn participant_change_rotates() {
        let (mut store, _) = store();
        let env = CountingEnv::default();
        store.set_participants([PEER]);

        store.current_key(&env);
        store.confirm(KeyId::UNCONFIRMED, KeyId(7)).unwrap();
        store.add_participant(UserId(3));
        assert_eq!(store.state(), RotationState::Stale(KeyId(7)));

        let next = store.current_key(&env);
        assert!(matches!(next, CurrentKey::Created { .. }));
        // stale key still decrypts history
        assert!(store.get(ME, KeyId(7)).is_some());
    }

    #[test]
    fn unchanged_membership_does_not_rotate() {
        let (mut store, _) = store();
        let env = CountingEnv::default();
        store.set_participants([PEER]);
        store.current_key(&env);
        store.confirm(KeyId::UNCONFIRMED, KeyId(7)).unwrap();

        store.set_participants([PEER]);
        store.add_participant(PEER);
        store.remove_participant(UserId(3));

        assert_eq!(store.state(), RotationState::Current(KeyId(7)));
    }

    #[test]
    fn change_while_unconfirmed_defers_rotation() {
        let (mut store, _) = store();
        let env = CountingEnv::default();
        let created = store.current_key(&env);
        store.add_participant(PEER);

        // the pending key keeps encrypting until the server confirms it
        let reused = store.current_key(&env);
        assert_eq!(
            reused,
            CurrentKey::Existing { key_id: KeyId::UNCONFIRMED, key: created.key().clone() }
        );

        let confirmed = store.confirm(KeyId::UNCONFIRMED, KeyId(7)).unwrap();
        assert_eq!(confirmed.unreached, BTreeSet::from([PEER]));
        assert_eq!(store.state(), RotationState::Stale(KeyId(7)));
        assert!(matches!(store.current_key(&env), CurrentKey::Created { .. }));
        assert_eq!(env.counter.get(), 2);
    }

    #[test]
    fn leave_while_unconfirmed_reaches_nobody_new() {
        let (mut store, _) = store();
        let env = CountingEnv::default();
        store.set_participants([PEER, UserId(3)]);
        store.current_key(&env);
        store.remove_participant(UserId(3));

        let confirmed = store.confirm(KeyId::UNCONFIRMED, KeyId(7)).unwrap();
        assert!(confirmed.unreached.is_empty());
        assert_eq!(store.state(), RotationState::Stale(KeyId(7)));
    }

    #[test]
    fn retracted_announcement_repeats_with_the_same_key() {
        let (mut store, _) = store();
        let env = CountingEnv::default();
        store.set_participants([PEER]);
        let created = store.current_key(&env);
        store.retract_announcement(created.key());
        store.add_participant(UserId(3));

        let again = store.current_key(&env);
        assert_eq!(
            again,
            CurrentKey::Created {
                key: created.key().clone(),
                recipients: BTreeSet::from([ME, PEER, UserId(3)]),
            }
        );
        assert_eq!(env.counter.get(), 1, "no second key generated");
        assert!(matches!(store.current_key(&env), CurrentKey::Existing { .. }));

        // announced to the current membership, so nobody is left behind
        let confirmed = store.confirm(KeyId::UNCONFIRMED, KeyId(7)).unwrap();
        assert!(confirmed.unreached.is_empty());
        assert_eq!(store.state(), RotationState::Current(KeyId(7)));

        // a late retraction of a confirmed key changes nothing
        store.retract_announcement(created.key());
        assert_eq!(store.current_key(&env).key_id(), KeyId(7));
    }

    #[tokio::test]
    async fn pending_resolution_wakes_on_add() {
        let (mut store, _) = store();
        let KeyResolution::Pending(first) = store.resolve(PEER, KeyId(4)) else {
            panic!("key not yet known");
        };
        let KeyResolution::Pending(second) = store.resolve(PEER, KeyId(4)) else {
            panic!("key not yet known");
        };

        assert!(store.begin_unwrap(PEER, KeyId(4)));
        assert!(!store.begin_unwrap(PEER, KeyId(4)), "unwrap deduplicated");
        store.add_key(PEER, KeyId(4), SendKey::new([4; 16])).unwrap();

        assert_eq!(first.await.unwrap(), SendKey::new([4; 16]));
        assert_eq!(second.await.unwrap(), SendKey::new([4; 16]));
        assert!(matches!(store.resolve(PEER, KeyId(4)), KeyResolution::Ready(_)));
        assert!(!store.begin_unwrap(PEER, KeyId(4)));
    }

    #[tokio::test]
    async fn rejection_is_permanent() {
        let (mut store, cache) = store();
        let KeyResolution::Pending(waiting) = store.resolve(PEER, KeyId(4)) else {
            panic!("key not yet known");
        };

        let missing = ClientError::Directory(DirectoryError::NotFound {
            user: PEER,
            kind: crate::directory::PublicKeyKind::Cu25519,
        });
        store.reject(PEER, KeyId(4), missing.clone());

        assert_eq!(waiting.await, Err(missing.clone()));
        let KeyResolution::Pending(later) = store.resolve(PEER, KeyId(4)) else {
            panic!("rejected keys are not ready");
        };
        assert_eq!(later.await, Err(missing));
        assert_eq!(cache.removed.borrow().as_slice(), &[(PEER, KeyId(4))]);
    }

    #[tokio::test]
    async fn own_unconfirmed_lookup_without_pending_key_fails_at_once() {
        let (mut store, _) = store();
        let KeyResolution::Pending(waiting) = store.resolve(ME, KeyId::UNCONFIRMED) else {
            panic!("no unconfirmed key is held");
        };
        assert_eq!(waiting.await, Err(ClientError::InvalidKeyId(KeyId::UNCONFIRMED)));
        assert!(store.keys.is_empty(), "no waiter left behind");
    }

    #[test]
    fn abandoned_lookups_are_pruned() {
        let (mut store, _) = store();
        for key_id in 1..=100 {
            drop(store.resolve(PEER, KeyId(key_id)));
        }
        assert_eq!(store.keys.len(), 1, "only the latest lookup lingers");

        let live = store.resolve(PEER, KeyId(500));
        drop(store.resolve(PEER, KeyId(501)));
        drop(store.resolve(PEER, KeyId(502)));
        assert!(store.keys.contains_key(&(PEER, KeyId(500))));
        assert!(!store.keys.contains_key(&(PEER, KeyId(501))));
        assert_eq!(store.keys.len(), 2);
        drop(live);
    }

    #[tokio::test]
    async fn dropped_store_abandons_waiters() {
        let (mut store, _) = store();
        let KeyResolution::Pending(waiting) = store.resolve(PEER, KeyId(4)) else {
            panic!("key not yet known");
        };
        drop(store);
        assert_eq!(waiting.await, Err(ClientError::Abandoned));
    }

    #[test]
    fn conflicting_add_refused() {
        let (mut store, _) = store();
        store.add_key(PEER, KeyId(4), SendKey::new([4; 16])).unwrap();
        store.add_key(PEER, KeyId(4), SendKey::new([4; 16])).unwrap();

        assert_eq!(
            store.add_key(PEER, KeyId(4), SendKey::new([5; 16])),
            Err(ClientError::KeyMismatch { owner: PEER, key_id: KeyId(4) })
        );
        assert_eq!(store.get(PEER, KeyId(4)), Some(SendKey::new([4; 16])));
    }

    #[test]
    fn warm_start_loads_cached_keys() {
        let cache = Rc::new(VecCache::default());
        cache
            .put(ChatId(9), &CachedKey { owner: PEER, key_id: KeyId(4), key: SendKey::new([4; 16]) })
            .unwrap();
        cache
            .put(ChatId(8), &CachedKey { owner: PEER, key_id: KeyId(5), key: SendKey::new([5; 16]) })
            .unwrap();

        let store = KeyStore::open(ChatId(9), ME, cache).unwrap();
        assert_eq!(store.get(PEER, KeyId(4)), Some(SendKey::new([4; 16])));
        assert_eq!(store.get(PEER, KeyId(5)), None, "other chats are not loaded");
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Send,
        SendFailed,
        Confirm,
        Join(u64),
        Leave(u64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => Just(Step::Send),
            1 => Just(Step::SendFailed),
            2 => Just(Step::Confirm),
            1 => (2..6u64).prop_map(Step::Join),
            1 => (2..6u64).prop_map(Step::Leave),
        ]
    }

    proptest! {
        #[test]
        fn rotation_never_strands_a_member(steps in prop::collection::vec(step(), 0..48)) {
            let (mut store, _) = store();
            let env = CountingEnv::default();
            let mut next_id = 1;
            let mut announced: Option<BTreeSet<UserId>> = None;
            let mut confirmed_keys: HashMap<KeyId, SendKey> = HashMap::new();

            for step in steps {
                match step {
                    Step::Send | Step::SendFailed => {
                        let pending = store.get(ME, KeyId::UNCONFIRMED);
                        let current = store.current_key(&env);
                        match &current {
                            CurrentKey::Created { key, recipients } => {
                                // PROPERTY: a key command goes out only when none is in
                                // effect, and reaches every current member and ourselves
                                prop_assert!(announced.is_none());
                                prop_assert_eq!(recipients, &store.recipients());
                                // PROPERTY: an announced-again key keeps its bytes
                                if let Some(pending) = &pending {
                                    prop_assert_eq!(key, pending);
                                }
                                announced = Some(recipients.clone());
                            },
                            CurrentKey::Existing { key_id, key } if key_id.is_unconfirmed() => {
                                prop_assert!(announced.is_some());
                                prop_assert_eq!(Some(key), pending.as_ref());
                            },
                            CurrentKey::Existing { key_id, key } => {
                                prop_assert_eq!(store.state(), RotationState::Current(*key_id));
                                prop_assert_eq!(confirmed_keys.get(key_id), Some(key));
                            },
                        }
                        if matches!(step, Step::SendFailed)
                            && matches!(current, CurrentKey::Created { .. })
                        {
                            store.retract_announcement(current.key());
                            announced = None;
                        }
                    },
                    Step::Confirm => {
                        let Some(pending) = store.get(ME, KeyId::UNCONFIRMED) else {
                            prop_assert_eq!(
                                store.confirm(KeyId::UNCONFIRMED, KeyId(next_id)),
                                Err(ClientError::NoUnconfirmedKey)
                            );
                            continue;
                        };
                        if announced.is_none() {
                            // the server only confirms keys it was sent
                            continue;
                        }
                        let confirmed = store.confirm(KeyId::UNCONFIRMED, KeyId(next_id))
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                        prop_assert_eq!(&confirmed.key, &pending);

                        // PROPERTY: every member either got the key command or is
                        // reported for a follow-up
                        let reached = announced.take().unwrap_or_default();
                        for member in store.participants() {
                            prop_assert!(
                                reached.contains(member) != confirmed.unreached.contains(member)
                            );
                        }
                        prop_assert!(confirmed.unreached.is_subset(store.participants()));

                        confirmed_keys.insert(KeyId(next_id), confirmed.key);
                        next_id += 1;
                    },
                    Step::Join(user) => store.add_participant(UserId(user)),
                    Step::Leave(user) => store.remove_participant(UserId(user)),
                }
                prop_assert_eq!(store.has_unconfirmed(), store.get(ME, KeyId::UNCONFIRMED).is_some());
            }
        }
    }
}
