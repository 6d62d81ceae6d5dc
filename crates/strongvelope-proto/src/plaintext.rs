//! Framing of the payload before encryption.
//!
//! ```text
//! backref_id(8) count(2) backrefs(8 * count) content
//! ```
//!
//! Protocol versions 1 and 2 stored the binary header as one character per
//! byte in a UTF-8 string, so header bytes `0x80..=0xFF` take two bytes on
//! the wire and the content must itself be valid UTF-8. Version 3 stores the
//! header raw.

use std::str::CharIndices;

use bytes::BufMut;

use crate::{
    errors::{ProtocolError, Result},
    message::MAX_BACKREFS,
};

/// Size of the header without backrefs
pub const HEADER_SIZE: usize = 10;

/// How the binary header is represented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackRefFraming {
    /// Each header byte is a code point `U+0000..=U+00FF`, UTF-8 encoded
    CharPerByte,
    /// Header bytes as-is
    Raw,
}

/// Decrypted payload: backref chain plus message content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plaintext {
    /// Random id of this message
    pub backref_id: u64,
    /// Backref ids of earlier messages
    pub backrefs: Vec<u64>,
    /// Message bytes
    pub content: Vec<u8>,
}

impl Plaintext {
    /// Encode with the given header framing
    pub fn encode(&self, framing: BackRefFraming) -> Result<Vec<u8>> {
        if self.backrefs.len() > MAX_BACKREFS {
            return Err(ProtocolError::TooManyBackRefs {
                count: self.backrefs.len(),
                max: MAX_BACKREFS,
            });
        }

        let mut header = Vec::with_capacity(HEADER_SIZE + 8 * self.backrefs.len());
        header.put_u64(self.backref_id);
        // INVARIANT: count bounded by MAX_BACKREFS above
        header.put_u16(self.backrefs.len() as u16);
        for backref in &self.backrefs {
            header.put_u64(*backref);
        }

        let mut out = match framing {
            BackRefFraming::Raw => header,
            BackRefFraming::CharPerByte => {
                if std::str::from_utf8(&self.content).is_err() {
                    return Err(ProtocolError::MalformedPlaintext(
                        "char-per-byte framing requires UTF-8 content",
                    ));
                }
                let mut out = Vec::with_capacity(header.len() * 2 + self.content.len());
                let mut utf8 = [0u8; 2];
                for byte in header {
                    out.put_slice(char::from(byte).encode_utf8(&mut utf8).as_bytes());
                }
                out
            },
        };
        out.put_slice(&self.content);
        Ok(out)
    }

    /// Decode with the given header framing.
    ///
    /// Fails if the header is short, if the backref count exceeds the limit
    /// or the remaining bytes, or (char-per-byte) if the bytes are not UTF-8
    /// or a header character is above `U+00FF`.
    pub fn decode(bytes: &[u8], framing: BackRefFraming) -> Result<Self> {
        match framing {
            BackRefFraming::Raw => Self::decode_raw(bytes),
            BackRefFraming::CharPerByte => Self::decode_char_per_byte(bytes),
        }
    }

    fn decode_raw(bytes: &[u8]) -> Result<Self> {
        let Some((fixed, rest)) = bytes.split_first_chunk::<HEADER_SIZE>() else {
            return Err(ProtocolError::MalformedPlaintext("shorter than backref header"));
        };
        let (id, count) = split_header(fixed);
        let count = checked_count(count)?;

        let refs_len = count * 8;
        if rest.len() < refs_len {
            return Err(ProtocolError::MalformedPlaintext("backref list exceeds payload"));
        }
        let (refs, content) = rest.split_at(refs_len);

        Ok(Self {
            backref_id: id,
            backrefs: refs
                .chunks_exact(8)
                .map(|c| {
                    let Ok(c) = c.try_into() else { unreachable!("chunks_exact(8)") };
                    u64::from_be_bytes(c)
                })
                .collect(),
            content: content.to_vec(),
        })
    }

    fn decode_char_per_byte(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::MalformedPlaintext("char-per-byte payload is not UTF-8"))?;
        let mut chars = text.char_indices();

        let mut fixed = [0u8; HEADER_SIZE];
        take_bytes(&mut chars, &mut fixed)?;
        let (id, count) = split_header(&fixed);
        let count = checked_count(count)?;

        let mut backrefs = Vec::with_capacity(count);
        for _ in 0..count {
            let mut raw = [0u8; 8];
            take_bytes(&mut chars, &mut raw)?;
            backrefs.push(u64::from_be_bytes(raw));
        }

        let content_start = chars.next().map_or(bytes.len(), |(idx, _)| idx);
        Ok(Self { backref_id: id, backrefs, content: bytes[content_start..].to_vec() })
    }
}

fn split_header(fixed: &[u8; HEADER_SIZE]) -> (u64, u16) {
    let [a, b, c, d, e, f, g, h, hi, lo] = *fixed;
    (u64::from_be_bytes([a, b, c, d, e, f, g, h]), u16::from_be_bytes([hi, lo]))
}

fn checked_count(count: u16) -> Result<usize> {
    let count = usize::from(count);
    if count > MAX_BACKREFS {
        return Err(ProtocolError::TooManyBackRefs { count, max: MAX_BACKREFS });
    }
    Ok(count)
}

fn take_bytes(chars: &mut CharIndices<'_>, out: &mut [u8]) -> Result<()> {
    for slot in out {
        let (_, ch) =
            chars.next().ok_or(ProtocolError::MalformedPlaintext("shorter than backref header"))?;
        *slot = u8::try_from(ch)
            .map_err(|_| ProtocolError::MalformedPlaintext("header character above U+00FF"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample() -> Plaintext {
        Plaintext {
            backref_id: 0x00FF_8001_0203_0405,
            backrefs: vec![1, u64::MAX],
            content: "héllo".as_bytes().to_vec(),
        }
    }

    #[test]
    fn raw_layout() {
        let bytes = sample().encode(BackRefFraming::Raw).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 16 + "héllo".len());
        assert_eq!(&bytes[8..10], &[0, 2]);
    }

    #[test]
    fn char_per_byte_expands_high_bytes() {
        let bytes = sample().encode(BackRefFraming::CharPerByte).unwrap();
        // 0xFF and 0x80 in the id, eight 0xFF in the second backref
        assert_eq!(bytes.len(), HEADER_SIZE + 16 + 10 + "héllo".len());
        assert!(std::str::from_utf8(&bytes).is_ok());
        assert_eq!(Plaintext::decode(&bytes, BackRefFraming::CharPerByte).unwrap(), sample());
    }

    #[test]
    fn framings_are_not_interchangeable() {
        let bytes = sample().encode(BackRefFraming::CharPerByte).unwrap();
        assert_ne!(Plaintext::decode(&bytes, BackRefFraming::Raw).ok(), Some(sample()));
    }

    #[test]
    fn binary_content_needs_raw_framing() {
        let pt = Plaintext { content: vec![0xFF, 0xFE], ..Plaintext::default() };
        assert!(pt.encode(BackRefFraming::CharPerByte).is_err());
        assert_eq!(
            Plaintext::decode(&pt.encode(BackRefFraming::Raw).unwrap(), BackRefFraming::Raw)
                .unwrap(),
            pt
        );
    }

    #[test]
    fn count_beyond_payload_rejected() {
        let mut bytes = sample().encode(BackRefFraming::Raw).unwrap();
        bytes[9] = 30;
        assert!(Plaintext::decode(&bytes, BackRefFraming::Raw).is_err());
        bytes[9] = 33;
        assert_eq!(
            Plaintext::decode(&bytes, BackRefFraming::Raw).unwrap_err(),
            ProtocolError::TooManyBackRefs { count: 33, max: MAX_BACKREFS }
        );
    }

    #[test]
    fn short_payload_rejected() {
        assert!(Plaintext::decode(&[0; 9], BackRefFraming::Raw).is_err());
        assert!(Plaintext::decode(b"short", BackRefFraming::CharPerByte).is_err());
    }

    proptest! {
        #[test]
        fn raw_round_trip(
            backref_id in any::<u64>(),
            backrefs in prop::collection::vec(any::<u64>(), 0..=MAX_BACKREFS),
            content in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let pt = Plaintext { backref_id, backrefs, content };
            let bytes = pt.encode(BackRefFraming::Raw).unwrap();
            prop_assert_eq!(Plaintext::decode(&bytes, BackRefFraming::Raw).unwrap(), pt);
        }

        #[test]
        fn char_per_byte_round_trip(
            backref_id in any::<u64>(),
            backrefs in prop::collection::vec(any::<u64>(), 0..=MAX_BACKREFS),
            content in ".{0,64}",
        ) {
            let pt = Plaintext { backref_id, backrefs, content: content.into_bytes() };
            let bytes = pt.encode(BackRefFraming::CharPerByte).unwrap();
            prop_assert_eq!(Plaintext::decode(&bytes, BackRefFraming::CharPerByte).unwrap(), pt);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = Plaintext::decode(&bytes, BackRefFraming::Raw);
            let _ = Plaintext::decode(&bytes, BackRefFraming::CharPerByte);
        }
    }
}
