//! Reference model of key rotation for model-based testing.
//!
//! Operations are generated randomly and applied both to [`RotationModel`]
//! and to a real handler; the observed outcomes must agree.

use std::collections::BTreeSet;

use arbitrary::Arbitrary;

/// Index of a simulated peer (kept small so joins and leaves collide)
pub type PeerId = u8;

/// Operations on one chat from the local user's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub enum Operation {
    /// Send a message of `len` bytes
    Send {
        /// Content length
        len: u8,
    },
    /// Deliver the server's confirmation of the outstanding key
    Confirm,
    /// A peer joins
    Join {
        /// Peer joining
        peer: PeerId,
    },
    /// A peer leaves
    Leave {
        /// Peer leaving
        peer: PeerId,
    },
}

/// Observable result of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Message sent under a newly created key
    NewKey,
    /// Message sent under the current confirmed key
    ReusedConfirmed,
    /// Message sent under the outstanding unconfirmed key
    ReusedUnconfirmed,
    /// Outstanding key confirmed
    Confirmed,
    /// Outstanding key confirmed and forwarded to peers who joined after it
    /// was announced
    ConfirmedWithFollowUp,
    /// Confirmation with nothing outstanding
    NothingToConfirm,
    /// Membership changed or stayed the same
    Membership,
}

/// Expected key store behavior
#[derive(Debug, Clone, Default)]
pub struct RotationModel {
    peers: BTreeSet<PeerId>,
    confirmed: bool,
    stale: bool,
    /// Staleness of the unconfirmed key, if one is outstanding
    unconfirmed: Option<bool>,
    /// Peers the outstanding key was announced to
    announced_to: BTreeSet<PeerId>,
}

impl RotationModel {
    /// Model with no peers and no key
    pub fn new() -> Self {
        Self::default()
    }

    /// Current peers
    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    /// Whether a key awaits confirmation
    pub fn has_unconfirmed(&self) -> bool {
        self.unconfirmed.is_some()
    }

    /// Apply `op` and return what the real system must report
    pub fn apply(&mut self, op: Operation) -> Outcome {
        match op {
            Operation::Send { .. } => self.send(),
            Operation::Confirm => match self.unconfirmed.take() {
                Some(stale) => {
                    self.confirmed = true;
                    self.stale = stale;
                    let announced = std::mem::take(&mut self.announced_to);
                    if self.peers.is_subset(&announced) {
                        Outcome::Confirmed
                    } else {
                        Outcome::ConfirmedWithFollowUp
                    }
                },
                None => Outcome::NothingToConfirm,
            },
            Operation::Join { peer } => {
                if self.peers.insert(peer) {
                    self.membership_changed();
                }
                Outcome::Membership
            },
            Operation::Leave { peer } => {
                if self.peers.remove(&peer) {
                    self.membership_changed();
                }
                Outcome::Membership
            },
        }
    }

    fn send(&mut self) -> Outcome {
        if self.confirmed && !self.stale {
            return Outcome::ReusedConfirmed;
        }
        if self.unconfirmed.is_some() {
            return Outcome::ReusedUnconfirmed;
        }
        self.unconfirmed = Some(false);
        self.announced_to = self.peers.clone();
        Outcome::NewKey
    }

    fn membership_changed(&mut self) {
        if self.confirmed {
            self.stale = true;
        }
        if let Some(stale) = &mut self.unconfirmed {
            *stale = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_after_confirm_rotates() {
        let mut model = RotationModel::new();
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::NewKey);
        assert_eq!(model.apply(Operation::Confirm), Outcome::Confirmed);
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::ReusedConfirmed);
        model.apply(Operation::Join { peer: 4 });
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::NewKey);
    }

    #[test]
    fn join_while_unconfirmed_reuses_then_rotates() {
        let mut model = RotationModel::new();
        model.apply(Operation::Send { len: 1 });
        model.apply(Operation::Join { peer: 4 });
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::ReusedUnconfirmed);
        assert_eq!(model.apply(Operation::Confirm), Outcome::ConfirmedWithFollowUp);
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::NewKey);
    }

    #[test]
    fn leave_while_unconfirmed_needs_no_follow_up() {
        let mut model = RotationModel::new();
        model.apply(Operation::Join { peer: 4 });
        model.apply(Operation::Send { len: 1 });
        model.apply(Operation::Leave { peer: 4 });
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::ReusedUnconfirmed);
        assert_eq!(model.apply(Operation::Confirm), Outcome::Confirmed);
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::NewKey);
    }

    #[test]
    fn repeated_join_is_not_a_change() {
        let mut model = RotationModel::new();
        model.apply(Operation::Join { peer: 4 });
        model.apply(Operation::Send { len: 1 });
        model.apply(Operation::Confirm);
        model.apply(Operation::Join { peer: 4 });
        assert_eq!(model.apply(Operation::Send { len: 1 }), Outcome::ReusedConfirmed);
    }
}
