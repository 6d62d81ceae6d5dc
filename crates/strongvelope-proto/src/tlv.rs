//! Type-length-value records used inside encrypted envelopes.
//!
//! A record is a 1-byte type, a 2-byte big-endian length and the value. The
//! legacy layout (protocol version 1) inserts a reserved zero byte between
//! type and length. Both layouts appear in live history, so both are read.
//!
//! In the current layout a length of `0xFFFF` means "the value runs to the
//! end of the buffer". Such a record is necessarily the last one.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// Length sentinel for a value that occupies the rest of the buffer
pub const LENGTH_TO_END: u16 = 0xFFFF;

/// Record header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvMode {
    /// `type(1) len(2)`, with the rest-of-buffer sentinel
    Current,
    /// `type(1) 0x00 len(2)`, no sentinel
    Legacy,
}

impl TlvMode {
    /// Size of a record header in this layout
    pub const fn header_len(self) -> usize {
        match self {
            Self::Current => 3,
            Self::Legacy => 4,
        }
    }
}

/// Known record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TlvType {
    /// Detached Ed25519 signature
    Signature = 0x01,
    /// Envelope type, legacy layout only
    MessageType = 0x02,
    /// Master nonce for the payload IV
    Nonce = 0x03,
    /// Recipient of the following KEYS record, legacy layout only
    Recipient = 0x04,
    /// Wrapped key for the preceding recipient, legacy layout only
    Keys = 0x05,
    /// Key id (and optional previous key id) of the payload key, legacy only
    KeyIds = 0x06,
    /// Ciphertext, or the plain management payload
    Payload = 0x07,
    /// User added to the chat, or the target of a privilege change
    IncParticipant = 0x08,
    /// User removed from the chat
    ExcParticipant = 0x09,
    /// Key wrapped for the sender, legacy layout only
    OwnKey = 0x0A,
    /// User who performed a management action
    Invitor = 0x0B,
    /// New privilege level
    Privilege = 0x0C,
    /// Multi-recipient wrapped key blob
    KeyBlob = 0x0F,
}

impl TlvType {
    /// Parse a type byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Signature,
            0x02 => Self::MessageType,
            0x03 => Self::Nonce,
            0x04 => Self::Recipient,
            0x05 => Self::Keys,
            0x06 => Self::KeyIds,
            0x07 => Self::Payload,
            0x08 => Self::IncParticipant,
            0x09 => Self::ExcParticipant,
            0x0A => Self::OwnKey,
            0x0B => Self::Invitor,
            0x0C => Self::Privilege,
            0x0F => Self::KeyBlob,
            _ => return None,
        })
    }

    /// Wire value
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Types that may repeat out of order (recipient/key pairs)
    pub const fn is_repeatable(self) -> bool {
        matches!(self, Self::Recipient | Self::Keys)
    }
}

/// Check the record ordering rule.
///
/// Types must be non-decreasing, except that repeatable types may interleave
/// with each other.
pub fn check_order(previous: Option<u8>, next: u8) -> Result<()> {
    let Some(previous) = previous else {
        return Ok(());
    };

    if next >= previous {
        return Ok(());
    }

    let repeatable = |t: u8| TlvType::from_u8(t).is_some_and(TlvType::is_repeatable);
    if repeatable(previous) && repeatable(next) {
        return Ok(());
    }

    Err(ProtocolError::RecordOutOfOrder { previous, record_type: next })
}

/// A record borrowed from the buffer it was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    /// Raw type byte
    pub record_type: u8,
    /// Value bytes
    pub value: &'a [u8],
    /// Offset of the record header within the buffer
    pub offset: usize,
    /// Offset one past the end of the value
    pub end: usize,
}

impl TlvRecord<'_> {
    /// Known type of this record, if any
    pub fn kind(&self) -> Option<TlvType> {
        TlvType::from_u8(self.record_type)
    }

    /// Value as a fixed-size array, failing on any other length
    pub fn fixed<const N: usize>(&self) -> Result<[u8; N]> {
        self.value.try_into().map_err(|_| ProtocolError::RecordLength {
            record_type: self.record_type,
            expected: N,
            actual: self.value.len(),
        })
    }

    /// Value as a big-endian `u64`
    pub fn u64_be(&self) -> Result<u64> {
        self.fixed::<8>().map(u64::from_be_bytes)
    }
}

/// Lazy, restartable record reader.
///
/// Yields one `Result` per record. After the first error, or after a
/// rest-of-buffer record, the reader is exhausted.
///
/// # Security
///
/// Every declared length is checked against the bytes that remain before the
/// value is sliced. A record that would read past the buffer yields
/// [`ProtocolError::RecordOverrun`] instead of a short value.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    start: usize,
    pos: usize,
    mode: TlvMode,
    finished: bool,
}

impl<'a> TlvReader<'a> {
    /// Read records from `buf` beginning at `offset`
    pub fn new(buf: &'a [u8], offset: usize, mode: TlvMode) -> Self {
        Self { buf, start: offset, pos: offset, mode, finished: false }
    }

    /// Rewind to the first record
    pub fn restart(&mut self) {
        self.pos = self.start;
        self.finished = false;
    }

    /// Offset of the next record
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Header layout in use
    pub fn mode(&self) -> TlvMode {
        self.mode
    }

    fn read_record(&self) -> Result<TlvRecord<'a>> {
        let offset = self.pos;
        let header_len = self.mode.header_len();
        let available = self.buf.len().saturating_sub(offset);

        let Some(header) = self.buf.get(offset..offset.saturating_add(header_len)) else {
            return Err(ProtocolError::TruncatedRecordHeader {
                offset,
                needed: header_len,
                available,
            });
        };

        let (record_type, declared) = match (self.mode, header) {
            (TlvMode::Current, &[t, hi, lo]) => (t, u16::from_be_bytes([hi, lo])),
            (TlvMode::Legacy, &[t, reserved, hi, lo]) => {
                if reserved != 0 {
                    return Err(ProtocolError::ReservedByteSet { offset, value: reserved });
                }
                (t, u16::from_be_bytes([hi, lo]))
            },
            // INVARIANT: `get` returned exactly `header_len` bytes for this mode
            _ => unreachable!("header slice length matches mode"),
        };

        let data_start = offset + header_len;

        if self.mode == TlvMode::Current && declared == LENGTH_TO_END {
            let value = self.buf.get(data_start..).unwrap_or_default();
            return Ok(TlvRecord { record_type, value, offset, end: self.buf.len() });
        }

        let len = usize::from(declared);
        let end = data_start + len;
        let value = self.buf.get(data_start..end).ok_or(ProtocolError::RecordOverrun {
            record_type,
            offset,
            declared: len,
            available: self.buf.len() - data_start,
        })?;

        Ok(TlvRecord { record_type, value, offset, end })
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<TlvRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.pos == self.buf.len() {
            return None;
        }

        let result = self.read_record();
        match &result {
            Ok(record) => {
                self.pos = record.end;
                if record.end == self.buf.len() {
                    self.finished = true;
                }
            },
            Err(_) => self.finished = true,
        }

        Some(result)
    }
}

/// Record writer.
///
/// A value of `0xFFFF` bytes or more is written with the rest-of-buffer
/// sentinel in the current layout, after which no further record may be
/// appended. The legacy layout has no sentinel and rejects such values.
#[derive(Debug, Clone)]
pub struct TlvWriter {
    buf: Vec<u8>,
    mode: TlvMode,
    finished: bool,
}

impl TlvWriter {
    /// Empty writer
    pub fn new(mode: TlvMode) -> Self {
        Self { buf: Vec::new(), mode, finished: false }
    }

    /// Append a record of a known type
    pub fn write(&mut self, record_type: TlvType, value: &[u8]) -> Result<&mut Self> {
        self.write_raw(record_type.to_u8(), value)
    }

    /// Append a record with an arbitrary type byte
    pub fn write_raw(&mut self, record_type: u8, value: &[u8]) -> Result<&mut Self> {
        if self.finished {
            return Err(ProtocolError::WriteAfterFinal);
        }

        let declared = match u16::try_from(value.len()) {
            Ok(len) if len != LENGTH_TO_END => len,
            _ if self.mode == TlvMode::Current => {
                self.finished = true;
                LENGTH_TO_END
            },
            _ => {
                return Err(ProtocolError::ValueTooLong {
                    len: value.len(),
                    max: usize::from(LENGTH_TO_END - 1),
                });
            },
        };

        self.buf.reserve(self.mode.header_len() + value.len());
        self.buf.put_u8(record_type);
        if self.mode == TlvMode::Legacy {
            self.buf.put_u8(0);
        }
        self.buf.put_u16(declared);
        self.buf.put_slice(value);

        Ok(self)
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encoded records
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn collect(buf: &[u8], mode: TlvMode) -> Result<Vec<(u8, Vec<u8>)>> {
        TlvReader::new(buf, 0, mode).map(|r| r.map(|r| (r.record_type, r.value.to_vec()))).collect()
    }

    #[test]
    fn current_layout_bytes() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Nonce, &[0xAA, 0xBB]).unwrap();
        assert_eq!(w.as_bytes(), &[0x03, 0x00, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn legacy_layout_bytes() {
        let mut w = TlvWriter::new(TlvMode::Legacy);
        w.write(TlvType::Nonce, &[0xAA]).unwrap();
        assert_eq!(w.as_bytes(), &[0x03, 0x00, 0x00, 0x01, 0xAA]);
    }

    #[test]
    fn legacy_reserved_byte_must_be_zero() {
        let buf = [0x03, 0x01, 0x00, 0x01, 0xAA];
        let err = collect(&buf, TlvMode::Legacy).unwrap_err();
        assert_eq!(err, ProtocolError::ReservedByteSet { offset: 0, value: 1 });
    }

    #[test]
    fn overrun_is_framing_error() {
        let buf = [0x07, 0x00, 0x10, 1, 2, 3];
        let err = collect(&buf, TlvMode::Current).unwrap_err();
        assert!(err.is_framing());
        assert_eq!(
            err,
            ProtocolError::RecordOverrun { record_type: 0x07, offset: 0, declared: 16, available: 3 }
        );
    }

    #[test]
    fn truncated_header_is_framing_error() {
        let buf = [0x03, 0x00, 0x01, 0xAA, 0x07, 0x00];
        let mut reader = TlvReader::new(&buf, 0, TlvMode::Current);
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedRecordHeader { offset: 4, .. }));
        assert!(reader.next().is_none());
    }

    #[test]
    fn sentinel_value_runs_to_end() {
        let value = vec![0x5A; 0x1_0000];
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Nonce, &[1; 12]).unwrap();
        w.write(TlvType::Payload, &value).unwrap();
        assert_eq!(w.write(TlvType::KeyBlob, &[1]).unwrap_err(), ProtocolError::WriteAfterFinal);

        let records = collect(w.as_bytes(), TlvMode::Current).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], (0x07, value));
    }

    #[test]
    fn legacy_rejects_oversized_value() {
        let mut w = TlvWriter::new(TlvMode::Legacy);
        let err = w.write(TlvType::Payload, &vec![0; 0xFFFF]).unwrap_err();
        assert!(matches!(err, ProtocolError::ValueTooLong { len: 0xFFFF, .. }));
    }

    #[test]
    fn reader_restarts_at_offset() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Signature, &[9; 4]).unwrap().write(TlvType::Payload, b"x").unwrap();
        let mut buf = vec![0xEE, 0xEE];
        buf.extend_from_slice(w.as_bytes());

        let mut reader = TlvReader::new(&buf, 2, TlvMode::Current);
        let first: Vec<_> = reader.by_ref().map(|r| r.unwrap().record_type).collect();
        reader.restart();
        let second: Vec<_> = reader.map(|r| r.unwrap().record_type).collect();
        assert_eq!(first, vec![0x01, 0x07]);
        assert_eq!(first, second);
    }

    #[test]
    fn ordering_rule() {
        assert!(check_order(None, 0x07).is_ok());
        assert!(check_order(Some(0x03), 0x07).is_ok());
        assert!(check_order(Some(0x0F), 0x0F).is_ok());
        assert!(check_order(Some(0x05), 0x04).is_ok());
        assert_eq!(
            check_order(Some(0x07), 0x03),
            Err(ProtocolError::RecordOutOfOrder { previous: 0x07, record_type: 0x03 })
        );
        assert!(check_order(Some(0x06), 0x04).is_err());
    }

    fn record() -> impl Strategy<Value = (u8, Vec<u8>)> {
        (1u8..=0x0F, prop::collection::vec(any::<u8>(), 0..300))
    }

    proptest! {
        #[test]
        fn records_round_trip(records in prop::collection::vec(record(), 0..8), legacy in any::<bool>()) {
            let mode = if legacy { TlvMode::Legacy } else { TlvMode::Current };
            let mut w = TlvWriter::new(mode);
            for (t, v) in &records {
                w.write_raw(*t, v).unwrap();
            }
            prop_assert_eq!(collect(w.as_bytes(), mode).unwrap(), records);
        }

        #[test]
        fn arbitrary_bytes_never_overread(buf in prop::collection::vec(any::<u8>(), 0..512), legacy in any::<bool>()) {
            let mode = if legacy { TlvMode::Legacy } else { TlvMode::Current };
            for record in TlvReader::new(&buf, 0, mode) {
                match record {
                    Ok(r) => prop_assert!(r.end <= buf.len()),
                    Err(e) => prop_assert!(e.is_framing()),
                }
            }
        }

        #[test]
        fn truncation_fails_closed(records in prop::collection::vec(record(), 1..6), cut in 1usize..64) {
            let mut w = TlvWriter::new(TlvMode::Current);
            for (t, v) in &records {
                w.write_raw(*t, v).unwrap();
            }
            let bytes = w.as_bytes();
            let cut = cut.min(bytes.len());
            let truncated = &bytes[..bytes.len() - cut];
            let decoded = collect(truncated, TlvMode::Current);
            // A clean cut at a record boundary is a shorter valid list; anything
            // else must be rejected, never returned as a shortened value.
            if let Ok(decoded) = decoded {
                prop_assert!(decoded.len() < records.len());
                prop_assert_eq!(&decoded[..], &records[..decoded.len()]);
            }
        }
    }
}
