//! Encrypted envelope carried in a message command payload.
//!
//! The first byte is the protocol version, and it selects the layout:
//!
//! ```text
//! v1     version(1) legacy-TLV...          type in a MESSAGE_TYPE record,
//!                                          8-byte key ids in KEY_IDS
//! v2/v3  version(1) type(1) TLV...         key id lives in the command
//! ```
//!
//! In both layouts the SIGNATURE record comes first and the signed content is
//! every byte after it. Each layout has its own decoder; [`Envelope::decode`]
//! dispatches on the version byte.

use crate::{
    errors::{ProtocolError, Result},
    ids::{KeyId, UserId},
    plaintext::BackRefFraming,
    tlv::{self, TlvMode, TlvReader, TlvRecord, TlvType, TlvWriter},
};

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Master nonce size
pub const NONCE_SIZE: usize = 12;

/// Envelope protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// Legacy TLV, 8-byte key ids, key not bound into the signature
    V1 = 1,
    /// Current TLV, 4-byte key ids
    V2 = 2,
    /// As V2 with raw backref framing
    V3 = 3,
}

impl ProtocolVersion {
    /// Version emitted by default
    pub const CURRENT: Self = Self::V3;

    /// Parse a version byte
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }

    /// Wire value
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Width of a key id on the wire
    pub const fn key_id_width(self) -> usize {
        match self {
            Self::V1 => 8,
            Self::V2 | Self::V3 => 4,
        }
    }

    /// Plaintext header framing
    pub const fn backref_framing(self) -> BackRefFraming {
        match self {
            Self::V1 | Self::V2 => BackRefFraming::CharPerByte,
            Self::V3 => BackRefFraming::Raw,
        }
    }
}

/// Envelope type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeType {
    /// Legacy message carrying its own wrapped keys
    Keyed = 0x00,
    /// Content encrypted with an already announced key
    Followup = 0x01,
    /// Participant added or removed
    AlterParticipants = 0x02,
    /// History truncated
    Truncate = 0x03,
    /// Privilege changed
    PrivChange = 0x04,
    /// Chat title changed
    ChatTitle = 0x05,
    /// Call ended
    CallEnded = 0x06,
    /// Call started
    CallStarted = 0x07,
}

impl EnvelopeType {
    /// Parse a type byte; `None` for types this client does not know
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Keyed,
            0x01 => Self::Followup,
            0x02 => Self::AlterParticipants,
            0x03 => Self::Truncate,
            0x04 => Self::PrivChange,
            0x05 => Self::ChatTitle,
            0x06 => Self::CallEnded,
            0x07 => Self::CallStarted,
            _ => return None,
        })
    }

    /// Wire value
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Records common to both layouts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeBody {
    /// Master nonce
    pub nonce: Option<[u8; NONCE_SIZE]>,
    /// Ciphertext, or plain management payload
    pub payload: Option<Vec<u8>>,
    /// Added users, or the target of a privilege change
    pub inc_participants: Vec<UserId>,
    /// Removed users
    pub exc_participants: Vec<UserId>,
    /// User who performed a management action
    pub invitor: Option<UserId>,
    /// New privilege, raw
    pub privilege: Option<i8>,
    /// Multi-recipient wrapped keys
    pub key_blobs: Option<Vec<u8>>,
}

/// Accumulates records while enforcing order and singleton rules
#[derive(Default)]
struct BodyParser {
    body: EnvelopeBody,
    previous: Option<u8>,
}

impl BodyParser {
    fn order(&mut self, record: &TlvRecord<'_>) -> Result<()> {
        tlv::check_order(self.previous, record.record_type)?;
        self.previous = Some(record.record_type);
        Ok(())
    }

    fn singleton<T>(slot: &mut Option<T>, record_type: TlvType, value: T) -> Result<()> {
        if slot.is_some() {
            return Err(ProtocolError::DuplicateRecord(record_type.to_u8()));
        }
        *slot = Some(value);
        Ok(())
    }

    /// Handle a record valid in both layouts; `Ok(false)` if not one of them
    fn common(&mut self, record: &TlvRecord<'_>) -> Result<bool> {
        let Some(kind) = record.kind() else {
            return Err(ProtocolError::UnexpectedRecord(record.record_type));
        };
        let body = &mut self.body;
        match kind {
            TlvType::Nonce => Self::singleton(&mut body.nonce, kind, record.fixed()?)?,
            TlvType::Payload => Self::singleton(&mut body.payload, kind, record.value.to_vec())?,
            TlvType::IncParticipant => body.inc_participants.push(UserId(record.u64_be()?)),
            TlvType::ExcParticipant => body.exc_participants.push(UserId(record.u64_be()?)),
            TlvType::Invitor => Self::singleton(&mut body.invitor, kind, UserId(record.u64_be()?))?,
            TlvType::Privilege => {
                let [raw] = record.fixed::<1>()?;
                Self::singleton(&mut body.privilege, kind, i8::from_be_bytes([raw]))?;
            },
            TlvType::KeyBlob => {
                body.key_blobs.get_or_insert_with(Vec::new).extend_from_slice(record.value);
            },
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn signature_of(record: &TlvRecord<'_>, index: usize) -> Result<[u8; SIGNATURE_SIZE]> {
    if index != 0 {
        return Err(ProtocolError::DuplicateRecord(TlvType::Signature.to_u8()));
    }
    record.fixed()
}

/// Envelope of protocol version 2 or 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentEnvelope {
    /// Protocol version (V2 or V3)
    pub version: ProtocolVersion,
    /// Raw envelope type; see [`EnvelopeType`]
    pub envelope_type: u8,
    /// Detached signature; absent on unsigned API messages
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
    /// Bytes covered by the signature
    pub signed_content: Vec<u8>,
    /// Remaining records
    pub body: EnvelopeBody,
}

impl CurrentEnvelope {
    /// Offset of the first record
    pub const RECORDS_OFFSET: usize = 2;

    /// Decode a version 2 or 3 envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&[version, envelope_type], _)) = bytes.split_first_chunk::<2>() else {
            return Err(ProtocolError::TruncatedRecordHeader {
                offset: 0,
                needed: Self::RECORDS_OFFSET,
                available: bytes.len(),
            });
        };
        let version = ProtocolVersion::from_u8(version)?;
        if version == ProtocolVersion::V1 {
            return Err(ProtocolError::UnsupportedVersion(version.to_u8()));
        }

        let mut parser = BodyParser::default();
        let mut signature = None;
        let mut signed_from = Self::RECORDS_OFFSET;

        for (index, record) in
            TlvReader::new(bytes, Self::RECORDS_OFFSET, TlvMode::Current).enumerate()
        {
            let record = record?;
            parser.order(&record)?;
            if record.kind() == Some(TlvType::Signature) {
                signature = Some(signature_of(&record, index)?);
                signed_from = record.end;
            } else if !parser.common(&record)? {
                return Err(ProtocolError::UnexpectedRecord(record.record_type));
            }
        }

        Ok(Self {
            version,
            envelope_type,
            signature,
            signed_content: bytes[signed_from..].to_vec(),
            body: parser.body,
        })
    }

    /// Assemble `version type SIGNATURE signed_content`
    pub fn seal(
        version: ProtocolVersion,
        envelope_type: u8,
        signature: &[u8; SIGNATURE_SIZE],
        signed_content: &[u8],
    ) -> Result<Vec<u8>> {
        if version == ProtocolVersion::V1 {
            return Err(ProtocolError::UnsupportedVersion(version.to_u8()));
        }
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Signature, signature)?;

        let mut out = Vec::with_capacity(2 + w.len() + signed_content.len());
        out.push(version.to_u8());
        out.push(envelope_type);
        out.extend_from_slice(w.as_bytes());
        out.extend_from_slice(signed_content);
        Ok(out)
    }
}

/// Envelope of protocol version 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEnvelope {
    /// Raw envelope type from the `MESSAGE_TYPE` record
    pub envelope_type: u8,
    /// Detached signature
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
    /// Bytes covered by the signature
    pub signed_content: Vec<u8>,
    /// Key that encrypted the payload
    pub key_id: KeyId,
    /// Previous key, announced together with a rotation
    pub prev_key_id: Option<KeyId>,
    /// Remaining records
    pub body: EnvelopeBody,
}

impl LegacyEnvelope {
    /// Offset of the first record
    pub const RECORDS_OFFSET: usize = 1;

    /// Decode a version 1 envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(&version) = bytes.first() else {
            return Err(ProtocolError::EmptyEnvelope);
        };
        if ProtocolVersion::from_u8(version)? != ProtocolVersion::V1 {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let mut parser = BodyParser::default();
        let mut signature = None;
        let mut signed_from = Self::RECORDS_OFFSET;
        let mut envelope_type = None;
        let mut key_ids = None;

        for (index, record) in
            TlvReader::new(bytes, Self::RECORDS_OFFSET, TlvMode::Legacy).enumerate()
        {
            let record = record?;
            parser.order(&record)?;
            match record.kind() {
                Some(TlvType::Signature) => {
                    signature = Some(signature_of(&record, index)?);
                    signed_from = record.end;
                },
                Some(TlvType::MessageType) => {
                    let [ty] = record.fixed::<1>()?;
                    BodyParser::singleton(&mut envelope_type, TlvType::MessageType, ty)?;
                },
                Some(TlvType::KeyIds) => {
                    BodyParser::singleton(&mut key_ids, TlvType::KeyIds, legacy_key_ids(&record)?)?;
                },
                // Inline wrapped keys of keyed messages are not decoded
                Some(TlvType::Recipient | TlvType::Keys | TlvType::OwnKey) => {},
                _ => {
                    if !parser.common(&record)? {
                        return Err(ProtocolError::UnexpectedRecord(record.record_type));
                    }
                },
            }
        }

        let envelope_type =
            envelope_type.ok_or(ProtocolError::MissingRecord(TlvType::MessageType.to_u8()))?;
        let (key_id, prev_key_id) =
            key_ids.ok_or(ProtocolError::MissingRecord(TlvType::KeyIds.to_u8()))?;

        Ok(Self {
            envelope_type,
            signature,
            signed_content: bytes[signed_from..].to_vec(),
            key_id,
            prev_key_id,
            body: parser.body,
        })
    }

    /// Assemble `version SIGNATURE signed_content`
    pub fn seal(signature: &[u8; SIGNATURE_SIZE], signed_content: &[u8]) -> Result<Vec<u8>> {
        let mut w = TlvWriter::new(TlvMode::Legacy);
        w.write(TlvType::Signature, signature)?;

        let mut out = Vec::with_capacity(1 + w.len() + signed_content.len());
        out.push(ProtocolVersion::V1.to_u8());
        out.extend_from_slice(w.as_bytes());
        out.extend_from_slice(signed_content);
        Ok(out)
    }

    /// Encode a `KEY_IDS` value: one or two 8-byte big-endian ids
    pub fn key_ids_value(key_id: KeyId, prev_key_id: Option<KeyId>) -> Vec<u8> {
        let mut out = u64::from(key_id.0).to_be_bytes().to_vec();
        if let Some(prev) = prev_key_id {
            out.extend_from_slice(&u64::from(prev.0).to_be_bytes());
        }
        out
    }
}

fn legacy_key_ids(record: &TlvRecord<'_>) -> Result<(KeyId, Option<KeyId>)> {
    let width = ProtocolVersion::V1.key_id_width();
    let ids = match record.value.len() {
        8 => (record.value, None),
        16 => {
            let (current, prev) = record.value.split_at(width);
            (current, Some(prev))
        },
        actual => {
            return Err(ProtocolError::RecordLength {
                record_type: record.record_type,
                expected: width,
                actual,
            });
        },
    };

    let parse = |raw: &[u8]| -> Result<KeyId> {
        let Ok(raw) = <[u8; 8]>::try_from(raw) else { unreachable!("8-byte key id") };
        KeyId::try_from(u64::from_be_bytes(raw))
    };
    Ok((parse(ids.0)?, ids.1.map(parse).transpose()?))
}

/// Envelope of any supported version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Version 1
    Legacy(LegacyEnvelope),
    /// Version 2 or 3
    Current(CurrentEnvelope),
}

impl Envelope {
    /// Decode, selecting the layout from the version byte
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(&version) = bytes.first() else {
            return Err(ProtocolError::EmptyEnvelope);
        };
        match ProtocolVersion::from_u8(version)? {
            ProtocolVersion::V1 => LegacyEnvelope::decode(bytes).map(Self::Legacy),
            ProtocolVersion::V2 | ProtocolVersion::V3 => {
                CurrentEnvelope::decode(bytes).map(Self::Current)
            },
        }
    }

    /// Protocol version
    pub fn version(&self) -> ProtocolVersion {
        match self {
            Self::Legacy(_) => ProtocolVersion::V1,
            Self::Current(env) => env.version,
        }
    }

    /// Raw envelope type
    pub fn envelope_type(&self) -> u8 {
        match self {
            Self::Legacy(env) => env.envelope_type,
            Self::Current(env) => env.envelope_type,
        }
    }

    /// Detached signature, if present
    pub fn signature(&self) -> Option<&[u8; SIGNATURE_SIZE]> {
        match self {
            Self::Legacy(env) => env.signature.as_ref(),
            Self::Current(env) => env.signature.as_ref(),
        }
    }

    /// Bytes covered by the signature
    pub fn signed_content(&self) -> &[u8] {
        match self {
            Self::Legacy(env) => &env.signed_content,
            Self::Current(env) => &env.signed_content,
        }
    }

    /// Records common to both layouts
    pub fn body(&self) -> &EnvelopeBody {
        match self {
            Self::Legacy(env) => &env.body,
            Self::Current(env) => &env.body,
        }
    }

    /// Key id embedded in the envelope (legacy layout only)
    pub fn embedded_key_id(&self) -> Option<KeyId> {
        match self {
            Self::Legacy(env) => Some(env.key_id),
            Self::Current(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: [u8; SIGNATURE_SIZE] = [0x51; SIGNATURE_SIZE];

    fn current_signed() -> Vec<u8> {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Nonce, &[7; NONCE_SIZE]).unwrap();
        w.write(TlvType::Payload, b"ciphertext").unwrap();
        w.into_bytes()
    }

    #[test]
    fn current_round_trip() {
        let signed = current_signed();
        let bytes = CurrentEnvelope::seal(ProtocolVersion::V3, 0x01, &SIG, &signed).unwrap();
        let Envelope::Current(env) = Envelope::decode(&bytes).unwrap() else {
            panic!("expected current layout");
        };
        assert_eq!(env.version, ProtocolVersion::V3);
        assert_eq!(env.envelope_type, 0x01);
        assert_eq!(env.signature, Some(SIG));
        assert_eq!(env.signed_content, signed);
        assert_eq!(env.body.nonce, Some([7; NONCE_SIZE]));
        assert_eq!(env.body.payload.as_deref(), Some(&b"ciphertext"[..]));
    }

    #[test]
    fn legacy_round_trip() {
        let mut w = TlvWriter::new(TlvMode::Legacy);
        w.write(TlvType::MessageType, &[0x01]).unwrap();
        w.write(TlvType::Nonce, &[7; NONCE_SIZE]).unwrap();
        w.write(TlvType::KeyIds, &LegacyEnvelope::key_ids_value(KeyId(9), Some(KeyId(8))))
            .unwrap();
        w.write(TlvType::Payload, b"ct").unwrap();
        let bytes = LegacyEnvelope::seal(&SIG, w.as_bytes()).unwrap();

        let env = Envelope::decode(&bytes).unwrap();
        assert_eq!(env.version(), ProtocolVersion::V1);
        assert_eq!(env.embedded_key_id(), Some(KeyId(9)));
        assert_eq!(env.signed_content(), w.as_bytes());
        let Envelope::Legacy(legacy) = env else { panic!("expected legacy layout") };
        assert_eq!(legacy.prev_key_id, Some(KeyId(8)));
    }

    #[test]
    fn legacy_wide_key_id_fails_closed() {
        let mut w = TlvWriter::new(TlvMode::Legacy);
        w.write(TlvType::MessageType, &[0x01]).unwrap();
        w.write(TlvType::KeyIds, &(1u64 << 40).to_be_bytes()).unwrap();
        let bytes = LegacyEnvelope::seal(&SIG, w.as_bytes()).unwrap();
        assert_eq!(Envelope::decode(&bytes), Err(ProtocolError::KeyIdOverflow(1 << 40)));
    }

    #[test]
    fn out_of_order_records_rejected() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Payload, b"ct").unwrap();
        w.write(TlvType::Nonce, &[7; NONCE_SIZE]).unwrap();
        let bytes = CurrentEnvelope::seal(ProtocolVersion::V2, 0x01, &SIG, w.as_bytes()).unwrap();
        assert_eq!(
            Envelope::decode(&bytes),
            Err(ProtocolError::RecordOutOfOrder { previous: 0x07, record_type: 0x03 })
        );
    }

    #[test]
    fn signature_must_lead() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Signature, &SIG).unwrap();
        let bytes = CurrentEnvelope::seal(ProtocolVersion::V3, 0x01, &SIG, w.as_bytes()).unwrap();
        assert_eq!(Envelope::decode(&bytes), Err(ProtocolError::DuplicateRecord(0x01)));
    }

    #[test]
    fn wrong_sizes_rejected() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Nonce, &[7; 11]).unwrap();
        let bytes = CurrentEnvelope::seal(ProtocolVersion::V3, 0x01, &SIG, w.as_bytes()).unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ProtocolError::RecordLength { record_type: 0x03, expected: 12, actual: 11 })
        ));

        let mut short_sig = vec![3, 1];
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Signature, &[0; 63]).unwrap();
        short_sig.extend_from_slice(w.as_bytes());
        assert!(Envelope::decode(&short_sig).unwrap_err().is_framing());
    }

    #[test]
    fn legacy_only_records_rejected_in_current_layout() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::KeyIds, &[0; 4]).unwrap();
        let bytes = CurrentEnvelope::seal(ProtocolVersion::V3, 0x01, &SIG, w.as_bytes()).unwrap();
        assert_eq!(Envelope::decode(&bytes), Err(ProtocolError::UnexpectedRecord(0x06)));
    }

    #[test]
    fn unsigned_management_envelope() {
        let mut bytes = vec![3, EnvelopeType::AlterParticipants.to_u8()];
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::IncParticipant, &5u64.to_be_bytes()).unwrap();
        w.write(TlvType::Invitor, &6u64.to_be_bytes()).unwrap();
        bytes.extend_from_slice(w.as_bytes());

        let env = Envelope::decode(&bytes).unwrap();
        assert!(env.signature().is_none());
        assert_eq!(env.body().inc_participants, vec![UserId(5)]);
        assert_eq!(env.body().invitor, Some(UserId(6)));
    }

    #[test]
    fn version_and_emptiness() {
        assert_eq!(Envelope::decode(&[]), Err(ProtocolError::EmptyEnvelope));
        assert_eq!(Envelope::decode(&[9, 1]), Err(ProtocolError::UnsupportedVersion(9)));
        assert!(Envelope::decode(&[3]).is_err());
    }
}
