//! In-memory public key directory with failure injection.

use std::{cell::RefCell, collections::HashMap, future::Future, rc::Rc};

use strongvelope_client::{DirectoryError, PublicKeyDirectory, PublicKeyKind};
use strongvelope_crypto::{PublicIdentity, encode_rsa_public};
use strongvelope_proto::UserId;

type Slot = (UserId, PublicKeyKind);

#[derive(Default)]
struct DirectoryState {
    keys: HashMap<Slot, Vec<u8>>,
    failures: HashMap<Slot, DirectoryError>,
    lookups: HashMap<Slot, usize>,
}

/// Directory shared by every simulated user.
///
/// Clones share state. Lookups of unpublished keys fail with `NotFound`.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Rc<RefCell<DirectoryState>>,
}

impl MemoryDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one key
    pub fn publish(&self, user: UserId, kind: PublicKeyKind, key: Vec<u8>) {
        self.state.borrow_mut().keys.insert((user, kind), key);
    }

    /// Publish every key of an identity
    pub fn publish_identity(&self, user: UserId, identity: &PublicIdentity) {
        self.publish(user, PublicKeyKind::Cu25519, identity.cu25519.to_vec());
        self.publish(user, PublicKeyKind::Ed25519, identity.ed25519.to_vec());
        if let Some(rsa) = &identity.rsa {
            self.publish(user, PublicKeyKind::Rsa, encode_rsa_public(rsa));
        }
    }

    /// Remove a published key
    pub fn unpublish(&self, user: UserId, kind: PublicKeyKind) {
        self.state.borrow_mut().keys.remove(&(user, kind));
    }

    /// Make lookups of `(user, kind)` fail with `error` until cleared
    pub fn fail(&self, user: UserId, kind: PublicKeyKind, error: DirectoryError) {
        self.state.borrow_mut().failures.insert((user, kind), error);
    }

    /// Stop injecting failures for `(user, kind)`
    pub fn clear_failure(&self, user: UserId, kind: PublicKeyKind) {
        self.state.borrow_mut().failures.remove(&(user, kind));
    }

    /// Number of lookups of `(user, kind)` so far
    pub fn lookups(&self, user: UserId, kind: PublicKeyKind) -> usize {
        self.state.borrow().lookups.get(&(user, kind)).copied().unwrap_or(0)
    }
}

impl PublicKeyDirectory for MemoryDirectory {
    fn public_key(
        &self,
        user: UserId,
        kind: PublicKeyKind,
    ) -> impl Future<Output = Result<Vec<u8>, DirectoryError>> {
        let mut state = self.state.borrow_mut();
        *state.lookups.entry((user, kind)).or_default() += 1;

        let result = match state.failures.get(&(user, kind)) {
            Some(error) => Err(error.clone()),
            None => state
                .keys
                .get(&(user, kind))
                .cloned()
                .ok_or(DirectoryError::NotFound { user, kind }),
        };
        std::future::ready(result)
    }
}
