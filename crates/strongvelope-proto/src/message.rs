//! In-memory chat message.
//!
//! A [`Message`] is created either locally, when composing (transaction id,
//! [`SendStatus::Sending`]), or from a received command (permanent id). The
//! payload holds plaintext once decrypted. Management messages carry their
//! type-specific structure encoded in the payload.

use std::borrow::Cow;

use thiserror::Error;

use crate::{
    errors::{ProtocolError, Result},
    ids::{KeyId, MessageId, UserId},
};

/// Most backrefs a message may carry
pub const MAX_BACKREFS: usize = 32;

/// Most distinct reactions on one message
pub const MAX_REACTIONS_PER_MESSAGE: usize = 50;

/// Most reactions one user may place on one message
pub const MAX_REACTIONS_PER_USER: usize = 24;

/// Offset between a special message type and its payload prefix byte
pub const SPECIAL_TYPE_OFFSET: u8 = 0x55;

/// Errors from message state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Permanent id already assigned
    #[error("message already has permanent id {current}, refusing {requested}")]
    AlreadyConfirmed {
        /// Assigned id
        current: MessageId,
        /// Id that was offered
        requested: MessageId,
    },

    /// Message has the maximum number of distinct reactions
    #[error("message has the maximum number of distinct reactions")]
    TooManyReactions,

    /// User has placed the maximum number of reactions
    #[error("user {0} has placed the maximum number of reactions")]
    TooManyUserReactions(UserId),

    /// Reaction text outside 1..=255 bytes
    #[error("reaction of {0} bytes is not 1..=255 bytes")]
    InvalidReaction(usize),
}

/// Message id, tagged by who assigned it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageIdentity {
    /// Assigned by the server; never changes
    Permanent(MessageId),
    /// Client transaction id, pending server confirmation
    Transaction(MessageId),
}

impl MessageIdentity {
    /// Raw id regardless of tag
    pub fn id(self) -> MessageId {
        match self {
            Self::Permanent(id) | Self::Transaction(id) => id,
        }
    }
}

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Not a valid message
    Invalid,
    /// Regular content
    Normal,
    /// Participant added or removed
    AlterParticipants,
    /// History truncated
    Truncate,
    /// Privilege changed
    PrivChange,
    /// Chat title changed
    ChatTitle,
    /// Call ended
    CallEnded,
    /// Call started
    CallStarted,
    /// Node attachment
    Attachment,
    /// Attachment access revoked
    RevokeAttachment,
    /// Shared contact
    Contact,
    /// Content with rich metadata
    ContainsMeta,
    /// Voice clip
    VoiceClip,
    /// Type this client does not know
    Other(u8),
}

impl MessageType {
    /// Parse a type code
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Invalid,
            0x01 => Self::Normal,
            0x02 => Self::AlterParticipants,
            0x03 => Self::Truncate,
            0x04 => Self::PrivChange,
            0x05 => Self::ChatTitle,
            0x06 => Self::CallEnded,
            0x07 => Self::CallStarted,
            0x65 => Self::Attachment,
            0x66 => Self::RevokeAttachment,
            0x67 => Self::Contact,
            0x68 => Self::ContainsMeta,
            0x69 => Self::VoiceClip,
            other => Self::Other(other),
        }
    }

    /// Type code
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Invalid => 0x00,
            Self::Normal => 0x01,
            Self::AlterParticipants => 0x02,
            Self::Truncate => 0x03,
            Self::PrivChange => 0x04,
            Self::ChatTitle => 0x05,
            Self::CallEnded => 0x06,
            Self::CallStarted => 0x07,
            Self::Attachment => 0x65,
            Self::RevokeAttachment => 0x66,
            Self::Contact => 0x67,
            Self::ContainsMeta => 0x68,
            Self::VoiceClip => 0x69,
            Self::Other(code) => code,
        }
    }

    /// Whether the type describes a chat state change
    pub const fn is_management(self) -> bool {
        matches!(
            self,
            Self::AlterParticipants
                | Self::Truncate
                | Self::PrivChange
                | Self::ChatTitle
                | Self::CallEnded
                | Self::CallStarted
        )
    }

    /// Whether the type is a user-content type with a payload prefix
    pub const fn is_special(self) -> bool {
        matches!(
            self,
            Self::Attachment
                | Self::RevokeAttachment
                | Self::Contact
                | Self::ContainsMeta
                | Self::VoiceClip
        )
    }

    /// Type of a decrypted user-content payload.
    ///
    /// Special types are stored as a `0x00, code - 0x55` prefix. Anything
    /// else is normal content.
    pub fn from_content(payload: &[u8]) -> Self {
        match payload {
            [0x00, sub, ..] => {
                let code = sub.wrapping_add(SPECIAL_TYPE_OFFSET);
                let ty = Self::from_u8(code);
                if ty.is_special() { ty } else { Self::Normal }
            },
            _ => Self::Normal,
        }
    }
}

/// Outcome of decrypting a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionStatus {
    /// Plaintext available (or never encrypted)
    Decrypted,
    /// Waiting for a key or a directory lookup; retry later
    Pending,
    /// Key can never be obtained
    NoKey,
    /// Signature check failed
    BadSignature,
    /// Envelope or plaintext framing is broken
    Malformed,
    /// Management type unknown to this client; retry after an update
    UnknownType,
}

impl EncryptionStatus {
    /// Whether retrying can never succeed
    pub const fn is_permanent_failure(self) -> bool {
        matches!(self, Self::NoKey | Self::BadSignature | Self::Malformed)
    }

    /// Whether the message has no usable plaintext
    pub const fn is_undecryptable(self) -> bool {
        !matches!(self, Self::Decrypted)
    }
}

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStatus {
    /// Queued for sending
    Sending,
    /// Send failed; waiting for the user to retry or discard
    SendingManual,
    /// Server acknowledged receipt
    ServerReceived,
    /// Server rejected the message
    ServerRejected,
    /// Delivered to a recipient
    Delivered,
    /// Received, not yet seen
    NotSeen,
    /// Seen
    Seen,
}

/// Participant privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i8)]
pub enum Privilege {
    /// Privilege unchanged (participant added)
    NoChange = -2,
    /// Not a participant (participant removed)
    NotPresent = -1,
    /// Read-only
    ReadOnly = 0,
    /// Can post
    Standard = 2,
    /// Can post and manage the chat
    Moderator = 3,
}

impl Privilege {
    /// Parse a wire value
    pub fn from_i8(value: i8) -> Result<Self> {
        Ok(match value {
            -2 => Self::NoChange,
            -1 => Self::NotPresent,
            0 => Self::ReadOnly,
            2 => Self::Standard,
            3 => Self::Moderator,
            other => return Err(ProtocolError::UnknownPrivilege(other)),
        })
    }

    /// Wire value
    pub const fn to_i8(self) -> i8 {
        self as i8
    }
}

/// Payload of membership and privilege changes: `target(8) privilege(1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementInfo {
    /// User the change applies to
    pub target: UserId,
    /// New privilege; `NotPresent` for removal, `NoChange` for addition
    pub privilege: Privilege,
}

impl ManagementInfo {
    /// Encoded size
    pub const SIZE: usize = 9;

    /// Encode
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.target.to_be_bytes());
        out[8] = self.privilege.to_i8().to_be_bytes()[0];
        out
    }

    /// Decode, requiring the exact size
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Ok(raw) = <[u8; Self::SIZE]>::try_from(bytes) else {
            return Err(ProtocolError::MalformedManagement("participant change is not 9 bytes"));
        };
        let [t0, t1, t2, t3, t4, t5, t6, t7, privilege] = raw;
        Ok(Self {
            target: UserId::from_be_bytes([t0, t1, t2, t3, t4, t5, t6, t7]),
            privilege: Privilege::from_i8(i8::from_be_bytes([privilege]))?,
        })
    }
}

/// Payload of a call-ended message: `call_id(8) duration(4) term_code(1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEndedInfo {
    /// Call identifier
    pub call_id: u64,
    /// Duration in seconds
    pub duration: u32,
    /// Termination reason
    pub term_code: u8,
}

impl CallEndedInfo {
    /// Encoded size
    pub const SIZE: usize = 13;

    /// Encode
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.call_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.duration.to_be_bytes());
        out[12] = self.term_code;
        out
    }

    /// Decode, requiring the exact size
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Ok(raw) = <[u8; Self::SIZE]>::try_from(bytes) else {
            return Err(ProtocolError::MalformedManagement("call info is not 13 bytes"));
        };
        let (call_id, rest) = raw.split_at(8);
        let (duration, term) = rest.split_at(4);
        let (Ok(call_id), Ok(duration)) = (call_id.try_into(), duration.try_into()) else {
            unreachable!("split of a fixed-size array")
        };
        Ok(Self {
            call_id: u64::from_be_bytes(call_id),
            duration: u32::from_be_bytes(duration),
            term_code: term[0],
        })
    }
}

/// One reaction and the users who placed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    /// Reaction text
    pub text: String,
    /// Reacting users, in the order they reacted
    pub users: Vec<UserId>,
}

/// Reactions on a message, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reactions {
    entries: Vec<Reaction>,
}

impl Reactions {
    /// Add `user`'s reaction. Returns `false` if it was already present.
    pub fn add(&mut self, user: UserId, text: &str) -> std::result::Result<bool, MessageError> {
        if text.is_empty() || text.len() > usize::from(u8::MAX) {
            return Err(MessageError::InvalidReaction(text.len()));
        }

        if self.users(text).contains(&user) {
            return Ok(false);
        }
        if self.count_for_user(user) >= MAX_REACTIONS_PER_USER {
            return Err(MessageError::TooManyUserReactions(user));
        }

        if let Some(entry) = self.entries.iter_mut().find(|r| r.text == text) {
            entry.users.push(user);
            return Ok(true);
        }

        if self.entries.len() >= MAX_REACTIONS_PER_MESSAGE {
            return Err(MessageError::TooManyReactions);
        }
        self.entries.push(Reaction { text: text.to_owned(), users: vec![user] });
        Ok(true)
    }

    /// Remove `user`'s reaction. Returns `false` if it was not present.
    pub fn remove(&mut self, user: UserId, text: &str) -> bool {
        let Some(idx) = self.entries.iter().position(|r| r.text == text) else {
            return false;
        };
        let entry = &mut self.entries[idx];
        let before = entry.users.len();
        entry.users.retain(|u| *u != user);
        let removed = entry.users.len() != before;
        if entry.users.is_empty() {
            self.entries.remove(idx);
        }
        removed
    }

    /// Users who placed `text`
    pub fn users(&self, text: &str) -> &[UserId] {
        self.entries.iter().find(|r| r.text == text).map_or(&[], |r| r.users.as_slice())
    }

    /// Number of reactions placed by `user`
    pub fn count_for_user(&self, user: UserId) -> usize {
        self.entries.iter().filter(|r| r.users.contains(&user)).count()
    }

    /// Reactions in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Reaction> {
        self.entries.iter()
    }

    /// Number of distinct reactions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no reactions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A chat message.
///
/// # Invariants
///
/// - Once the identity is [`MessageIdentity::Permanent`] it never changes.
/// - An empty payload with a non-zero `updated` is a deleted message, unless
///   the type is [`MessageType::Truncate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    identity: MessageIdentity,
    /// Sender
    pub sender: UserId,
    /// Creation time, seconds
    pub timestamp: u32,
    /// Seconds from creation to last edit; 0 if never edited
    pub updated: u16,
    /// Message type
    pub msg_type: MessageType,
    /// Key that encrypts (or encrypted) the payload
    pub key_id: KeyId,
    /// Plaintext, or ciphertext while undecrypted
    pub payload: Vec<u8>,
    /// Random id other messages use to reference this one
    pub backref_id: u64,
    /// Backref ids of earlier messages
    pub backrefs: Vec<u64>,
    /// Delivery state
    pub send_status: SendStatus,
    encryption: EncryptionStatus,
    reactions: Reactions,
}

impl Message {
    /// Locally composed message awaiting a server id
    pub fn new_outgoing(
        transaction_id: MessageId,
        sender: UserId,
        timestamp: u32,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            identity: MessageIdentity::Transaction(transaction_id),
            sender,
            timestamp,
            updated: 0,
            msg_type,
            key_id: KeyId::INVALID,
            payload,
            backref_id: 0,
            backrefs: Vec::new(),
            send_status: SendStatus::Sending,
            encryption: EncryptionStatus::Decrypted,
            reactions: Reactions::default(),
        }
    }

    /// Locally composed special message; prepends the type prefix to `body`
    pub fn new_special(
        transaction_id: MessageId,
        sender: UserId,
        timestamp: u32,
        msg_type: MessageType,
        body: &[u8],
    ) -> Self {
        debug_assert!(msg_type.is_special());
        let mut payload = Vec::with_capacity(body.len() + 2);
        payload.push(0x00);
        payload.push(msg_type.to_u8().wrapping_sub(SPECIAL_TYPE_OFFSET));
        payload.extend_from_slice(body);
        Self::new_outgoing(transaction_id, sender, timestamp, msg_type, payload)
    }

    /// Received message whose payload is not yet decrypted
    pub fn new_incoming(
        msg_id: MessageId,
        sender: UserId,
        timestamp: u32,
        updated: u16,
        key_id: KeyId,
    ) -> Self {
        Self {
            identity: MessageIdentity::Permanent(msg_id),
            sender,
            timestamp,
            updated,
            msg_type: MessageType::Normal,
            key_id,
            payload: Vec::new(),
            backref_id: 0,
            backrefs: Vec::new(),
            send_status: SendStatus::NotSeen,
            encryption: EncryptionStatus::Pending,
            reactions: Reactions::default(),
        }
    }

    /// Tagged id
    pub fn identity(&self) -> MessageIdentity {
        self.identity
    }

    /// Raw id
    pub fn id(&self) -> MessageId {
        self.identity.id()
    }

    /// Whether the message still has a transaction id
    pub fn is_sending(&self) -> bool {
        matches!(self.identity, MessageIdentity::Transaction(_))
    }

    /// Replace the transaction id with the server-assigned id.
    ///
    /// Repeating the same id is a no-op; a different one is refused.
    pub fn confirm_id(&mut self, msg_id: MessageId) -> std::result::Result<(), MessageError> {
        match self.identity {
            MessageIdentity::Permanent(current) if current == msg_id => Ok(()),
            MessageIdentity::Permanent(current) => {
                Err(MessageError::AlreadyConfirmed { current, requested: msg_id })
            },
            MessageIdentity::Transaction(_) => {
                self.identity = MessageIdentity::Permanent(msg_id);
                self.send_status = SendStatus::ServerReceived;
                Ok(())
            },
        }
    }

    /// Point the message at `to` if it currently uses `from`
    pub fn rebind_key(&mut self, from: KeyId, to: KeyId) -> bool {
        if self.key_id != from {
            return false;
        }
        self.key_id = to;
        true
    }

    /// Decryption outcome
    pub fn encryption_status(&self) -> EncryptionStatus {
        self.encryption
    }

    /// Record the decryption outcome
    pub fn set_encryption_status(&mut self, status: EncryptionStatus) {
        self.encryption = status;
    }

    /// Whether the payload is unusable
    pub fn is_undecryptable(&self) -> bool {
        self.encryption.is_undecryptable()
    }

    /// Drop any payload and flag the message as undecryptable
    pub fn mark_undecryptable(&mut self, status: EncryptionStatus) {
        debug_assert!(status.is_undecryptable());
        self.payload.clear();
        self.backrefs.clear();
        self.backref_id = 0;
        self.encryption = status;
    }

    /// Replace the payload after an edit
    pub fn edit(&mut self, payload: Vec<u8>, updated: u16) {
        debug_assert!(updated >= self.updated);
        self.payload = payload;
        self.updated = updated;
    }

    /// Whether the message was deleted by its sender
    pub fn is_deleted(&self) -> bool {
        self.updated != 0 && self.payload.is_empty() && self.msg_type != MessageType::Truncate
    }

    /// Whether the message is a chat state change
    pub fn is_management(&self) -> bool {
        self.msg_type.is_management()
    }

    /// Membership or privilege change carried in the payload
    pub fn management_info(&self) -> Result<ManagementInfo> {
        ManagementInfo::from_bytes(&self.payload)
    }

    /// Call summary carried in the payload
    pub fn call_ended_info(&self) -> Result<CallEndedInfo> {
        CallEndedInfo::from_bytes(&self.payload)
    }

    /// Display text: the payload without any special-type prefix
    pub fn to_text(&self) -> Cow<'_, str> {
        let body = if self.msg_type.is_special() {
            self.payload.get(2..).unwrap_or_default()
        } else {
            &self.payload
        };
        String::from_utf8_lossy(body)
    }

    /// Reactions
    pub fn reactions(&self) -> &Reactions {
        &self.reactions
    }

    /// Mutable reactions
    pub fn reactions_mut(&mut self) -> &mut Reactions {
        &mut self.reactions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> Message {
        Message::new_outgoing(MessageId(1), UserId(2), 100, MessageType::Normal, b"hi".to_vec())
    }

    #[test]
    fn permanent_id_never_changes() {
        let mut msg = outgoing();
        assert!(msg.is_sending());
        msg.confirm_id(MessageId(50)).unwrap();
        assert_eq!(msg.identity(), MessageIdentity::Permanent(MessageId(50)));
        msg.confirm_id(MessageId(50)).unwrap();
        assert_eq!(
            msg.confirm_id(MessageId(51)),
            Err(MessageError::AlreadyConfirmed {
                current: MessageId(50),
                requested: MessageId(51)
            })
        );
    }

    #[test]
    fn deleted_but_not_truncate() {
        let mut msg = outgoing();
        assert!(!msg.is_deleted());
        msg.edit(Vec::new(), 10);
        assert!(msg.is_deleted());
        msg.msg_type = MessageType::Truncate;
        assert!(!msg.is_deleted());
    }

    #[test]
    fn rebinding_only_matching_key() {
        let mut msg = outgoing();
        msg.key_id = KeyId::UNCONFIRMED;
        assert!(msg.rebind_key(KeyId::UNCONFIRMED, KeyId(7)));
        assert!(!msg.rebind_key(KeyId::UNCONFIRMED, KeyId(8)));
        assert_eq!(msg.key_id, KeyId(7));
    }

    #[test]
    fn special_prefix() {
        let msg = Message::new_special(
            MessageId(1),
            UserId(2),
            0,
            MessageType::Attachment,
            b"node-json",
        );
        assert_eq!(&msg.payload[..2], &[0x00, 0x10]);
        assert_eq!(MessageType::from_content(&msg.payload), MessageType::Attachment);
        assert_eq!(msg.to_text(), "node-json");
        assert_eq!(MessageType::from_content(b"\x00\x01text"), MessageType::Normal);
        assert_eq!(MessageType::from_content(b"plain"), MessageType::Normal);
    }

    #[test]
    fn management_info_exact_size() {
        let info = ManagementInfo { target: UserId(9), privilege: Privilege::NotPresent };
        assert_eq!(ManagementInfo::from_bytes(&info.to_bytes()).unwrap(), info);
        assert!(ManagementInfo::from_bytes(&info.to_bytes()[..8]).is_err());
        let mut bad = info.to_bytes();
        bad[8] = 1;
        assert_eq!(ManagementInfo::from_bytes(&bad), Err(ProtocolError::UnknownPrivilege(1)));
    }

    #[test]
    fn call_info_round_trip() {
        let info = CallEndedInfo { call_id: 0xDEAD, duration: 61, term_code: 2 };
        assert_eq!(CallEndedInfo::from_bytes(&info.to_bytes()).unwrap(), info);
    }

    #[test]
    fn undecryptable_drops_payload() {
        let mut msg = outgoing();
        msg.backrefs = vec![1, 2];
        msg.mark_undecryptable(EncryptionStatus::BadSignature);
        assert!(msg.payload.is_empty());
        assert!(msg.backrefs.is_empty());
        assert!(msg.encryption_status().is_permanent_failure());
        assert!(!EncryptionStatus::UnknownType.is_permanent_failure());
    }

    #[test]
    fn reactions_keep_insertion_order() {
        let mut r = Reactions::default();
        assert!(r.add(UserId(1), "b").unwrap());
        assert!(r.add(UserId(1), "a").unwrap());
        assert!(r.add(UserId(2), "b").unwrap());
        assert!(!r.add(UserId(2), "b").unwrap());
        let order: Vec<_> = r.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(r.users("b"), &[UserId(1), UserId(2)]);

        assert!(r.remove(UserId(1), "a"));
        assert!(!r.remove(UserId(1), "a"));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn reaction_caps() {
        let mut r = Reactions::default();
        for i in 0..MAX_REACTIONS_PER_USER {
            r.add(UserId(1), &format!("r{i}")).unwrap();
        }
        assert_eq!(r.add(UserId(1), "one more"), Err(MessageError::TooManyUserReactions(UserId(1))));

        for i in MAX_REACTIONS_PER_USER..MAX_REACTIONS_PER_MESSAGE {
            r.add(UserId(100 + i as u64), &format!("r{i}")).unwrap();
        }
        assert_eq!(r.len(), MAX_REACTIONS_PER_MESSAGE);
        assert_eq!(r.add(UserId(99), "new"), Err(MessageError::TooManyReactions));
        assert!(r.add(UserId(99), "r0").unwrap());
        assert_eq!(r.add(UserId(1), ""), Err(MessageError::InvalidReaction(0)));
    }
}
