//! Binary commands exchanged with the chat server.
//!
//! Every command starts with an opcode byte followed by a fixed,
//! opcode-specific body. All integers are big-endian.
//!
//! ```text
//! message   op(1) chat(8) user(8) msgid(8) ts(4) updated(2) keyid(4) len(4) payload
//! key       op(1) chat(8) keyid(4) bloblen(4) (user(8) len(2) wrapped)*
//! keyid     op(1) chat(8) keyxid(4) keyid(4)
//! msgid     op(1) msgxid(8) msgid(8)
//! reaction  op(1) chat(8) user(8) msgid(8) len(1) utf8
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::{
    errors::{ProtocolError, Result},
    ids::{ChatId, KeyId, MessageId, UserId},
};

/// Command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Message from history
    OldMsg = 2,
    /// New message (client transaction id outbound, permanent id inbound)
    NewMsg = 3,
    /// Edit or delete of a confirmed message
    MsgUpd = 4,
    /// Server assigns a permanent id to a transaction id
    NewMsgId = 10,
    /// Key announcement
    NewKey = 17,
    /// Server assigns a permanent key id to a local key id
    NewKeyId = 18,
    /// Edit of a message that is still unconfirmed
    MsgUpdX = 20,
    /// Server acknowledges a message already known by id
    MsgId = 21,
    /// Add a reaction
    AddReaction = 33,
    /// Remove a reaction
    DelReaction = 34,
    /// Message from node history
    NewNodeMsg = 44,
}

impl Opcode {
    /// Parse an opcode byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            2 => Self::OldMsg,
            3 => Self::NewMsg,
            4 => Self::MsgUpd,
            10 => Self::NewMsgId,
            17 => Self::NewKey,
            18 => Self::NewKeyId,
            20 => Self::MsgUpdX,
            21 => Self::MsgId,
            33 => Self::AddReaction,
            34 => Self::DelReaction,
            44 => Self::NewNodeMsg,
            _ => return None,
        })
    }

    /// Wire value
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether the opcode uses the message command layout
    pub const fn is_message(self) -> bool {
        matches!(self, Self::OldMsg | Self::NewMsg | Self::MsgUpd | Self::MsgUpdX | Self::NewNodeMsg)
    }
}

fn ensure(rd: &[u8], expected: usize) -> Result<()> {
    if rd.remaining() < expected {
        return Err(ProtocolError::CommandTruncated { expected, actual: rd.remaining() });
    }
    Ok(())
}

fn read_opcode(rd: &mut &[u8], expected: &'static str, accept: fn(Opcode) -> bool) -> Result<Opcode> {
    ensure(rd, 1)?;
    let byte = rd.get_u8();
    let opcode = Opcode::from_u8(byte).ok_or(ProtocolError::UnknownOpcode(byte))?;
    if !accept(opcode) {
        return Err(ProtocolError::UnexpectedOpcode { expected, actual: byte });
    }
    Ok(opcode)
}

/// New, update or history message command.
///
/// # Invariants
///
/// - `opcode.is_message()` holds.
/// - The payload length fits in the 32-bit length field; [`MsgCommand::encode`]
///   rejects anything larger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgCommand {
    /// Message opcode
    pub opcode: Opcode,
    /// Chat the message belongs to
    pub chat_id: ChatId,
    /// Sender
    pub user_id: UserId,
    /// Transaction id outbound, permanent id inbound
    pub msg_id: MessageId,
    /// Send time, seconds
    pub timestamp: u32,
    /// Seconds between send and last edit; 0 if never edited
    pub updated: u16,
    /// Key that encrypted the payload
    pub key_id: KeyId,
    /// Encrypted envelope
    pub payload: Bytes,
}

impl MsgCommand {
    /// Size of everything before the payload
    pub const HEADER_SIZE: usize = 39;

    /// Command with no key and no payload yet
    pub fn new(
        opcode: Opcode,
        chat_id: ChatId,
        user_id: UserId,
        msg_id: MessageId,
        timestamp: u32,
    ) -> Self {
        debug_assert!(opcode.is_message());
        Self {
            opcode,
            chat_id,
            user_id,
            msg_id,
            timestamp,
            updated: 0,
            key_id: KeyId::INVALID,
            payload: Bytes::new(),
        }
    }

    /// Size of the encoded command
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Encode into `dst`
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let len = u32::try_from(self.payload.len()).map_err(|_| ProtocolError::ValueTooLong {
            len: self.payload.len(),
            max: u32::MAX as usize,
        })?;

        dst.put_u8(self.opcode.to_u8());
        dst.put_u64(self.chat_id.0);
        dst.put_u64(self.user_id.0);
        dst.put_u64(self.msg_id.0);
        dst.put_u32(self.timestamp);
        dst.put_u16(self.updated);
        dst.put_u32(self.key_id.0);
        dst.put_u32(len);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into an immutable buffer for the transport
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.into())
    }

    /// Decode one message command from the front of `bytes`.
    ///
    /// Returns the command and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut rd = bytes;
        let opcode = read_opcode(&mut rd, "message", Opcode::is_message)?;
        ensure(rd, Self::HEADER_SIZE - 1)?;

        let chat_id = ChatId(rd.get_u64());
        let user_id = UserId(rd.get_u64());
        let msg_id = MessageId(rd.get_u64());
        let timestamp = rd.get_u32();
        let updated = rd.get_u16();
        let key_id = KeyId(rd.get_u32());
        let len = rd.get_u32() as usize;

        ensure(rd, len)?;
        let payload = Bytes::copy_from_slice(&rd[..len]);

        let cmd = Self { opcode, chat_id, user_id, msg_id, timestamp, updated, key_id, payload };
        Ok((cmd, Self::HEADER_SIZE + len))
    }
}

/// Concatenated `(recipient(8) len(2) wrapped)` entries.
///
/// Used by key commands and by chat title envelopes. Entries are validated
/// lazily: [`KeyBlobs::find`] stops at the first match without parsing the
/// rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBlobs {
    bytes: Vec<u8>,
}

impl KeyBlobs {
    /// Size of the per-entry header
    pub const ENTRY_HEADER_SIZE: usize = 10;

    /// Empty blob list
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes without parsing them
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Append an entry
    pub fn push(&mut self, recipient: UserId, wrapped: &[u8]) -> Result<()> {
        let len = u16::try_from(wrapped.len()).map_err(|_| ProtocolError::ValueTooLong {
            len: wrapped.len(),
            max: u16::MAX as usize,
        })?;

        let total = self.bytes.len() + Self::ENTRY_HEADER_SIZE + wrapped.len();
        if u32::try_from(total).is_err() {
            return Err(ProtocolError::ValueTooLong { len: total, max: u32::MAX as usize });
        }

        self.bytes.put_u64(recipient.0);
        self.bytes.put_u16(len);
        self.bytes.put_slice(wrapped);
        Ok(())
    }

    /// Encoded entries
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded size
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Iterate entries in order
    pub fn iter(&self) -> KeyBlobIter<'_> {
        KeyBlobIter::new(&self.bytes)
    }

    /// Wrapped key for `recipient`, if present
    pub fn find(&self, recipient: UserId) -> Result<Option<&[u8]>> {
        find_wrapped_key(&self.bytes, recipient)
    }
}

/// Linear scan of encoded key blob entries for one recipient.
///
/// Entries before the match are length-checked; entries after it are never
/// touched.
pub fn find_wrapped_key(blobs: &[u8], recipient: UserId) -> Result<Option<&[u8]>> {
    for entry in KeyBlobIter::new(blobs) {
        let (user, wrapped) = entry?;
        if user == recipient {
            return Ok(Some(wrapped));
        }
    }
    Ok(None)
}

/// Iterator over encoded key blob entries
#[derive(Debug, Clone)]
pub struct KeyBlobIter<'a> {
    rd: &'a [u8],
    failed: bool,
}

impl<'a> KeyBlobIter<'a> {
    /// Iterate the entries in `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { rd: bytes, failed: false }
    }
}

impl<'a> KeyBlobIter<'a> {
    fn read_entry(rd: &mut &'a [u8]) -> Result<(UserId, &'a [u8])> {
        ensure(rd, KeyBlobs::ENTRY_HEADER_SIZE)?;
        let user = UserId(rd.get_u64());
        let len = usize::from(rd.get_u16());
        ensure(rd, len)?;
        let data: &'a [u8] = *rd;
        let (wrapped, rest) = data.split_at(len);
        *rd = rest;
        Ok((user, wrapped))
    }
}

impl<'a> Iterator for KeyBlobIter<'a> {
    type Item = Result<(UserId, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rd.is_empty() {
            return None;
        }

        let entry = Self::read_entry(&mut self.rd);
        self.failed = entry.is_err();
        Some(entry)
    }
}

/// Key announcement.
///
/// Built incrementally: create with the local key id, append one wrapped key
/// per recipient, then encode. The blob length field always equals the bytes
/// appended so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCommand {
    /// Chat the key belongs to
    pub chat_id: ChatId,
    /// Local id outbound, permanent id once relayed
    pub key_id: KeyId,
    blobs: KeyBlobs,
}

impl KeyCommand {
    /// Size of everything before the blobs
    pub const HEADER_SIZE: usize = 17;

    /// Command with no recipients
    pub fn new(chat_id: ChatId, key_id: KeyId) -> Self {
        Self { chat_id, key_id, blobs: KeyBlobs::new() }
    }

    /// Append the key wrapped for `recipient`
    pub fn add_recipient(&mut self, recipient: UserId, wrapped: &[u8]) -> Result<()> {
        self.blobs.push(recipient, wrapped)
    }

    /// Current value of the blob length field
    pub fn blob_len(&self) -> u32 {
        // INVARIANT: `KeyBlobs::push` refuses to grow past u32::MAX
        self.blobs.len() as u32
    }

    /// Recipient entries
    pub fn blobs(&self) -> &KeyBlobs {
        &self.blobs
    }

    /// Wrapped key addressed to `recipient`
    pub fn wrapped_key_for(&self, recipient: UserId) -> Result<Option<&[u8]>> {
        self.blobs.find(recipient)
    }

    /// Size of the encoded command
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.blobs.len()
    }

    /// Encode into `dst`
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(Opcode::NewKey.to_u8());
        dst.put_u64(self.chat_id.0);
        dst.put_u32(self.key_id.0);
        dst.put_u32(self.blob_len());
        dst.put_slice(self.blobs.as_bytes());
    }

    /// Encode into an immutable buffer for the transport
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.into()
    }

    /// Decode one key command from the front of `bytes`.
    ///
    /// The recipient entries are kept encoded; see [`KeyCommand::wrapped_key_for`].
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut rd = bytes;
        read_opcode(&mut rd, "key", |op| op == Opcode::NewKey)?;
        ensure(rd, Self::HEADER_SIZE - 1)?;

        let chat_id = ChatId(rd.get_u64());
        let key_id = KeyId(rd.get_u32());
        let len = rd.get_u32() as usize;
        ensure(rd, len)?;

        let blobs = KeyBlobs::from_raw(rd[..len].to_vec());
        Ok((Self { chat_id, key_id, blobs }, Self::HEADER_SIZE + len))
    }
}

/// Server confirmation of a local key id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIdCommand {
    /// Chat the key belongs to
    pub chat_id: ChatId,
    /// Local id the client announced
    pub local_id: KeyId,
    /// Permanent id assigned by the server
    pub key_id: KeyId,
}

impl KeyIdCommand {
    /// Encoded size
    pub const SIZE: usize = 17;

    /// Encode into `dst`
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(Opcode::NewKeyId.to_u8());
        dst.put_u64(self.chat_id.0);
        dst.put_u32(self.local_id.0);
        dst.put_u32(self.key_id.0);
    }

    /// Decode from the front of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut rd = bytes;
        read_opcode(&mut rd, "key id", |op| op == Opcode::NewKeyId)?;
        ensure(rd, Self::SIZE - 1)?;
        let cmd = Self {
            chat_id: ChatId(rd.get_u64()),
            local_id: KeyId(rd.get_u32()),
            key_id: KeyId(rd.get_u32()),
        };
        Ok((cmd, Self::SIZE))
    }
}

/// Server confirmation of a message transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgIdCommand {
    /// Transaction id the client sent
    pub transaction_id: MessageId,
    /// Permanent id assigned by the server
    pub msg_id: MessageId,
}

impl MsgIdCommand {
    /// Encoded size
    pub const SIZE: usize = 17;

    /// Encode into `dst` as a `NewMsgId` confirmation
    pub fn encode(&self, dst: &mut impl BufMut) {
        self.encode_as(Opcode::NewMsgId, dst);
    }

    /// Encode into `dst` as a `MsgId` acknowledgement of a message the
    /// server already held
    pub fn encode_already_sent(&self, dst: &mut impl BufMut) {
        self.encode_as(Opcode::MsgId, dst);
    }

    fn encode_as(&self, opcode: Opcode, dst: &mut impl BufMut) {
        dst.put_u8(opcode.to_u8());
        dst.put_u64(self.transaction_id.0);
        dst.put_u64(self.msg_id.0);
    }

    /// Decode a `NewMsgId` confirmation from the front of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        Self::decode_as(bytes, "message id", |op| op == Opcode::NewMsgId)
    }

    /// Decode a `MsgId` acknowledgement from the front of `bytes`
    pub fn decode_already_sent(bytes: &[u8]) -> Result<(Self, usize)> {
        Self::decode_as(bytes, "already sent", |op| op == Opcode::MsgId)
    }

    fn decode_as(
        bytes: &[u8],
        expected: &'static str,
        accept: fn(Opcode) -> bool,
    ) -> Result<(Self, usize)> {
        let mut rd = bytes;
        read_opcode(&mut rd, expected, accept)?;
        ensure(rd, Self::SIZE - 1)?;
        let cmd = Self { transaction_id: MessageId(rd.get_u64()), msg_id: MessageId(rd.get_u64()) };
        Ok((cmd, Self::SIZE))
    }
}

/// Add or remove a reaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionCommand {
    /// `AddReaction` or `DelReaction`
    pub opcode: Opcode,
    /// Chat of the message
    pub chat_id: ChatId,
    /// Reacting user
    pub user_id: UserId,
    /// Message reacted to
    pub msg_id: MessageId,
    /// Reaction text, 1..=255 bytes
    pub reaction: String,
}

impl ReactionCommand {
    /// Size of everything before the reaction text
    pub const HEADER_SIZE: usize = 26;

    /// Encode into `dst`
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let len = match u8::try_from(self.reaction.len()) {
            Ok(len) if len > 0 => len,
            _ => return Err(ProtocolError::InvalidReaction(self.reaction.len())),
        };
        dst.put_u8(self.opcode.to_u8());
        dst.put_u64(self.chat_id.0);
        dst.put_u64(self.user_id.0);
        dst.put_u64(self.msg_id.0);
        dst.put_u8(len);
        dst.put_slice(self.reaction.as_bytes());
        Ok(())
    }

    /// Decode from the front of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut rd = bytes;
        let opcode = read_opcode(&mut rd, "reaction", |op| {
            matches!(op, Opcode::AddReaction | Opcode::DelReaction)
        })?;
        ensure(rd, Self::HEADER_SIZE - 1)?;
        let chat_id = ChatId(rd.get_u64());
        let user_id = UserId(rd.get_u64());
        let msg_id = MessageId(rd.get_u64());
        let len = usize::from(rd.get_u8());
        ensure(rd, len)?;
        if len == 0 {
            return Err(ProtocolError::InvalidReaction(0));
        }
        let reaction = std::str::from_utf8(&rd[..len])
            .map_err(|_| ProtocolError::MalformedPlaintext("reaction is not UTF-8"))?
            .to_owned();
        Ok((Self { opcode, chat_id, user_id, msg_id, reaction }, Self::HEADER_SIZE + len))
    }
}

/// Any command this crate understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Message, update or history message
    Message(MsgCommand),
    /// Key announcement
    Key(KeyCommand),
    /// Key id confirmation
    KeyId(KeyIdCommand),
    /// Message id confirmation
    MsgId(MsgIdCommand),
    /// Message the server already held, resent under a transaction id
    AlreadySent(MsgIdCommand),
    /// Reaction change
    Reaction(ReactionCommand),
}

impl Command {
    /// Opcode of this command
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Message(cmd) => cmd.opcode,
            Self::Key(_) => Opcode::NewKey,
            Self::KeyId(_) => Opcode::NewKeyId,
            Self::MsgId(_) => Opcode::NewMsgId,
            Self::AlreadySent(_) => Opcode::MsgId,
            Self::Reaction(cmd) => cmd.opcode,
        }
    }

    /// Encode into `dst`
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Message(cmd) => cmd.encode(dst),
            Self::Key(cmd) => {
                cmd.encode(dst);
                Ok(())
            },
            Self::KeyId(cmd) => {
                cmd.encode(dst);
                Ok(())
            },
            Self::MsgId(cmd) => {
                cmd.encode(dst);
                Ok(())
            },
            Self::AlreadySent(cmd) => {
                cmd.encode_already_sent(dst);
                Ok(())
            },
            Self::Reaction(cmd) => cmd.encode(dst),
        }
    }

    /// Decode one command from the front of `bytes`, dispatching on the opcode.
    ///
    /// Returns the command and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let Some(&first) = bytes.first() else {
            return Err(ProtocolError::CommandTruncated { expected: 1, actual: 0 });
        };
        let opcode = Opcode::from_u8(first).ok_or(ProtocolError::UnknownOpcode(first))?;

        Ok(match opcode {
            Opcode::OldMsg
            | Opcode::NewMsg
            | Opcode::MsgUpd
            | Opcode::MsgUpdX
            | Opcode::NewNodeMsg => {
                let (cmd, n) = MsgCommand::decode(bytes)?;
                (Self::Message(cmd), n)
            },
            Opcode::NewKey => {
                let (cmd, n) = KeyCommand::decode(bytes)?;
                (Self::Key(cmd), n)
            },
            Opcode::NewKeyId => {
                let (cmd, n) = KeyIdCommand::decode(bytes)?;
                (Self::KeyId(cmd), n)
            },
            Opcode::NewMsgId => {
                let (cmd, n) = MsgIdCommand::decode(bytes)?;
                (Self::MsgId(cmd), n)
            },
            Opcode::MsgId => {
                let (cmd, n) = MsgIdCommand::decode_already_sent(bytes)?;
                (Self::AlreadySent(cmd), n)
            },
            Opcode::AddReaction | Opcode::DelReaction => {
                let (cmd, n) = ReactionCommand::decode(bytes)?;
                (Self::Reaction(cmd), n)
            },
        })
    }

    /// Split a stream of concatenated commands
    pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Self>> {
        let mut commands = Vec::new();
        while !bytes.is_empty() {
            let (cmd, consumed) = Self::decode(bytes)?;
            debug_assert!(consumed > 0 && consumed <= bytes.len());
            commands.push(cmd);
            bytes = &bytes[consumed..];
        }
        Ok(commands)
    }
}
