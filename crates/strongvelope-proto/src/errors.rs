//! Error types for the strongvelope wire format.

use thiserror::Error;

/// Result alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire structures.
///
/// Every variant is permanent: the bytes that produced it will never decode
/// differently on a retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes left for a record header
    #[error("record header at offset {offset} needs {needed} bytes, {available} available")]
    TruncatedRecordHeader {
        /// Offset of the record within the buffer
        offset: usize,
        /// Bytes required by the header
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Record length points past the end of the buffer
    #[error("record {record_type:#04x} at offset {offset} declares {declared} bytes, {available} remain")]
    RecordOverrun {
        /// Type byte of the offending record
        record_type: u8,
        /// Offset of the record within the buffer
        offset: usize,
        /// Length claimed by the record header
        declared: usize,
        /// Bytes actually left after the header
        available: usize,
    },

    /// Legacy record with a non-zero reserved byte
    #[error("legacy record at offset {offset} has reserved byte {value:#04x}")]
    ReservedByteSet {
        /// Offset of the record within the buffer
        offset: usize,
        /// Value found in the reserved position
        value: u8,
    },

    /// Records appear out of order
    #[error("record {record_type:#04x} follows {previous:#04x}")]
    RecordOutOfOrder {
        /// Type of the preceding record
        previous: u8,
        /// Type of the record that broke the order
        record_type: u8,
    },

    /// Record type not valid in this envelope
    #[error("unexpected record type {0:#04x}")]
    UnexpectedRecord(u8),

    /// Singleton record appears more than once
    #[error("duplicate record {0:#04x}")]
    DuplicateRecord(u8),

    /// Required record is absent
    #[error("missing record {0:#04x}")]
    MissingRecord(u8),

    /// Record value has the wrong size
    #[error("record {record_type:#04x} is {actual} bytes, expected {expected}")]
    RecordLength {
        /// Type of the record
        record_type: u8,
        /// Required size
        expected: usize,
        /// Size found
        actual: usize,
    },

    /// Value too long for a length-prefixed field
    #[error("value of {len} bytes exceeds the {max} byte field limit")]
    ValueTooLong {
        /// Length of the value
        len: usize,
        /// Largest length the field can express
        max: usize,
    },

    /// Record appended after a rest-of-buffer record
    #[error("record written after the final record")]
    WriteAfterFinal,

    /// Command shorter than its layout requires
    #[error("command truncated: expected {expected} bytes, got {actual}")]
    CommandTruncated {
        /// Bytes needed to finish the command
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Opcode byte not known
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// Opcode valid but not for this command type
    #[error("opcode {actual:#04x} cannot start a {expected} command")]
    UnexpectedOpcode {
        /// Command type being decoded
        expected: &'static str,
        /// Opcode found
        actual: u8,
    },

    /// Empty envelope
    #[error("empty envelope")]
    EmptyEnvelope,

    /// Version byte outside the supported range
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Key id too wide for the 32-bit key id space
    #[error("key id {0:#x} does not fit in 32 bits")]
    KeyIdOverflow(u64),

    /// Backref list exceeds the limit
    #[error("{count} backrefs exceed the limit of {max}")]
    TooManyBackRefs {
        /// Number of backrefs supplied
        count: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Decrypted payload does not follow the plaintext framing
    #[error("malformed plaintext: {0}")]
    MalformedPlaintext(&'static str),

    /// Management record payload does not match its structure
    #[error("malformed management payload: {0}")]
    MalformedManagement(&'static str),

    /// Unknown privilege value
    #[error("unknown privilege {0}")]
    UnknownPrivilege(i8),

    /// Reaction text outside the allowed size
    #[error("reaction of {0} bytes is not 1..=255 bytes")]
    InvalidReaction(usize),
}

impl ProtocolError {
    /// Whether the error comes from record or command framing.
    ///
    /// Framing errors mean the bytes themselves are damaged or truncated, as
    /// opposed to well-formed bytes carrying unsupported content.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::TruncatedRecordHeader { .. }
                | Self::RecordOverrun { .. }
                | Self::ReservedByteSet { .. }
                | Self::RecordOutOfOrder { .. }
                | Self::UnexpectedRecord(_)
                | Self::DuplicateRecord(_)
                | Self::MissingRecord(_)
                | Self::RecordLength { .. }
                | Self::CommandTruncated { .. }
                | Self::EmptyEnvelope
                | Self::KeyIdOverflow(_)
        )
    }
}
