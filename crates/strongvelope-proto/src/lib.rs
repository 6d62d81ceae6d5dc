//! Wire format of the strongvelope secure chat protocol.
//!
//! Pure data and codecs, no cryptography and no I/O:
//!
//! - [`tlv`]: type-length-value records in the current and legacy layouts
//! - [`command`]: opcode-tagged commands exchanged with the chat server
//! - [`envelope`]: the signed envelope inside a message command, one decoder
//!   per protocol version layout
//! - [`plaintext`]: backref framing of the payload before encryption
//! - [`message`]: the in-memory chat message and its reactions
//!
//! Every decoder checks lengths before reading and returns a
//! [`ProtocolError`] instead of reading past a buffer.

pub mod command;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod message;
pub mod plaintext;
pub mod tlv;

pub use command::{
    Command, KeyBlobs, KeyCommand, KeyIdCommand, MsgCommand, MsgIdCommand, Opcode,
    ReactionCommand, find_wrapped_key,
};
pub use envelope::{
    CurrentEnvelope, Envelope, EnvelopeBody, EnvelopeType, LegacyEnvelope, NONCE_SIZE,
    ProtocolVersion, SIGNATURE_SIZE,
};
pub use errors::{ProtocolError, Result};
pub use ids::{ChatId, KeyId, MessageId, UserId};
pub use message::{
    CallEndedInfo, EncryptionStatus, ManagementInfo, Message, MessageError, MessageIdentity,
    MessageType, Privilege, Reaction, Reactions, SendStatus,
};
pub use plaintext::{BackRefFraming, Plaintext};
pub use tlv::{TlvMode, TlvReader, TlvRecord, TlvType, TlvWriter};
