//! Invariant checks over a simulated chat.
//!
//! These capture what must hold after any sequence of operations, not the
//! outcome of a particular scenario.

use std::{collections::HashSet, fmt};

use strongvelope_proto::{EncryptionStatus, Message};

use crate::{Relayed, SimRelay};

/// Invariant check result
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// No two keys of one chat share a permanent id
pub fn key_ids_unique(relay: &SimRelay) -> InvariantResult {
    let mut seen = HashSet::new();
    for &(owner, key_id) in relay.assigned_keys() {
        if !seen.insert(key_id) {
            return Err(Violation {
                invariant: "key_ids_unique",
                message: format!("key id {key_id} assigned twice (last to {owner})"),
            });
        }
    }
    Ok(())
}

/// Every relayed message uses a permanent key id, unless it is unencrypted
pub fn relayed_keys_confirmed(relay: &SimRelay) -> InvariantResult {
    for item in relay.log() {
        if let Relayed::Message(command) = item
            && !command.user_id.is_api()
            && !command.key_id.is_confirmed()
        {
            return Err(Violation {
                invariant: "relayed_keys_confirmed",
                message: format!("message {} relayed with key id {}", command.msg_id, command.key_id),
            });
        }
    }
    Ok(())
}

/// Received messages decrypt to what was sent, in order
pub fn decrypted_matches_sent(sent: &[Vec<u8>], received: &[Message]) -> InvariantResult {
    if sent.len() != received.len() {
        return Err(Violation {
            invariant: "decrypted_matches_sent",
            message: format!("sent {} messages, received {}", sent.len(), received.len()),
        });
    }
    for (index, (expected, msg)) in sent.iter().zip(received).enumerate() {
        if msg.encryption_status() != EncryptionStatus::Decrypted || &msg.payload != expected {
            return Err(Violation {
                invariant: "decrypted_matches_sent",
                message: format!("message {index} has status {:?}", msg.encryption_status()),
            });
        }
    }
    Ok(())
}
