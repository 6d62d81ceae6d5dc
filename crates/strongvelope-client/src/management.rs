//! Unencrypted management messages from the API sender.
//!
//! The server announces chat state changes as unsigned current-layout
//! envelopes with key id zero. Each type carries a fixed set of records:
//!
//! | Type | Records |
//! |---|---|
//! | `ALTER_PARTICIPANTS` | one `INC_PARTICIPANT` or one `EXC_PARTICIPANT`, optional `INVITOR` |
//! | `PRIV_CHANGE` | one `INC_PARTICIPANT`, `PRIVILEGE`, optional `INVITOR` |
//! | `TRUNCATE` | optional `INVITOR` |
//! | `CHAT_TITLE` | `PAYLOAD` (title envelope), `INVITOR` (author) |
//! | `CALL_ENDED` | `PAYLOAD` (`CallEndedInfo`), optional `INVITOR` |
//! | `CALL_STARTED` | optional `INVITOR` |

use strongvelope_proto::{
    CallEndedInfo, CurrentEnvelope, Envelope, EnvelopeBody, EnvelopeType, ManagementInfo,
    Message, MessageType, Privilege, ProtocolError, ProtocolVersion, TlvMode, TlvType, TlvWriter,
    UserId,
};

use crate::error::{ClientError, Result};

/// Type-specific content of a management message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementPayload {
    /// No content beyond the type
    Empty,
    /// Membership or privilege change
    Info(ManagementInfo),
    /// Call summary
    CallEnded(CallEndedInfo),
    /// Encrypted title envelope, decrypted separately
    Title(Vec<u8>),
}

/// Decoded management message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementRecord {
    /// Message type
    pub msg_type: MessageType,
    /// User who made the change, shown as the sender
    pub invitor: Option<UserId>,
    /// Type-specific content
    pub payload: ManagementPayload,
}

impl ManagementRecord {
    /// Decode an API envelope
    ///
    /// # Errors
    ///
    /// - `UnknownManagementType` for envelope types this client does not know
    /// - `Protocol` for missing or surplus records
    pub fn decode(envelope: &Envelope) -> Result<Self> {
        let raw_type = envelope.envelope_type();
        let Some(envelope_type) = EnvelopeType::from_u8(raw_type) else {
            return Err(ClientError::UnknownManagementType(raw_type));
        };
        let body = envelope.body();
        let invitor = body.invitor;

        let (msg_type, payload) = match envelope_type {
            EnvelopeType::AlterParticipants => {
                let info = match (body.inc_participants.as_slice(), body.exc_participants.as_slice()) {
                    ([target], []) => ManagementInfo {
                        target: *target,
                        privilege: match body.privilege {
                            Some(raw) => Privilege::from_i8(raw)?,
                            None => Privilege::NoChange,
                        },
                    },
                    ([], [target]) => {
                        ManagementInfo { target: *target, privilege: Privilege::NotPresent }
                    },
                    _ => {
                        return Err(ProtocolError::MalformedManagement(
                            "participant change needs exactly one target",
                        )
                        .into());
                    },
                };
                (MessageType::AlterParticipants, ManagementPayload::Info(info))
            },
            EnvelopeType::PrivChange => {
                let [target] = body.inc_participants.as_slice() else {
                    return Err(
                        ProtocolError::MalformedManagement("privilege change needs one target").into()
                    );
                };
                let raw = body
                    .privilege
                    .ok_or(ProtocolError::MissingRecord(TlvType::Privilege.to_u8()))?;
                let info = ManagementInfo { target: *target, privilege: Privilege::from_i8(raw)? };
                (MessageType::PrivChange, ManagementPayload::Info(info))
            },
            EnvelopeType::Truncate => (MessageType::Truncate, ManagementPayload::Empty),
            EnvelopeType::CallStarted => (MessageType::CallStarted, ManagementPayload::Empty),
            EnvelopeType::CallEnded => {
                let info = CallEndedInfo::from_bytes(required_payload(body)?)?;
                (MessageType::CallEnded, ManagementPayload::CallEnded(info))
            },
            EnvelopeType::ChatTitle => {
                if invitor.is_none() {
                    return Err(ProtocolError::MissingRecord(TlvType::Invitor.to_u8()).into());
                }
                (MessageType::ChatTitle, ManagementPayload::Title(required_payload(body)?.to_vec()))
            },
            EnvelopeType::Keyed | EnvelopeType::Followup => {
                return Err(ClientError::UnknownManagementType(raw_type));
            },
        };

        Ok(Self { msg_type, invitor, payload })
    }

    /// Encode as an unsigned API envelope of the current version
    pub fn encode(&self) -> Result<Vec<u8>> {
        let envelope_type = match self.msg_type {
            MessageType::AlterParticipants => EnvelopeType::AlterParticipants,
            MessageType::PrivChange => EnvelopeType::PrivChange,
            MessageType::Truncate => EnvelopeType::Truncate,
            MessageType::ChatTitle => EnvelopeType::ChatTitle,
            MessageType::CallEnded => EnvelopeType::CallEnded,
            MessageType::CallStarted => EnvelopeType::CallStarted,
            other => return Err(ClientError::UnknownManagementType(other.to_u8())),
        };

        let mut w = TlvWriter::new(TlvMode::Current);
        if let ManagementPayload::CallEnded(info) = &self.payload {
            w.write(TlvType::Payload, &info.to_bytes())?;
        }
        if let ManagementPayload::Title(blob) = &self.payload {
            w.write(TlvType::Payload, blob)?;
        }
        if let ManagementPayload::Info(info) = &self.payload {
            match info.privilege {
                Privilege::NotPresent => w.write(TlvType::ExcParticipant, &info.target.to_be_bytes())?,
                _ => w.write(TlvType::IncParticipant, &info.target.to_be_bytes())?,
            };
        }
        if let Some(invitor) = self.invitor {
            w.write(TlvType::Invitor, &invitor.to_be_bytes())?;
        }
        if let ManagementPayload::Info(info) = &self.payload
            && info.privilege != Privilege::NotPresent
            && (self.msg_type == MessageType::PrivChange || info.privilege != Privilege::NoChange)
        {
            w.write(TlvType::Privilege, &info.privilege.to_i8().to_be_bytes())?;
        }

        let mut out = vec![ProtocolVersion::CURRENT.to_u8(), envelope_type.to_u8()];
        out.extend_from_slice(w.as_bytes());
        debug_assert!(CurrentEnvelope::decode(&out).is_ok());
        Ok(out)
    }

    /// Fill a message with this record; the title is left to the caller.
    pub fn apply_to(&self, msg: &mut Message) {
        msg.msg_type = self.msg_type;
        if let Some(invitor) = self.invitor {
            msg.sender = invitor;
        }
        msg.payload = match &self.payload {
            ManagementPayload::Empty | ManagementPayload::Title(_) => Vec::new(),
            ManagementPayload::Info(info) => info.to_bytes().to_vec(),
            ManagementPayload::CallEnded(info) => info.to_bytes().to_vec(),
        };
    }
}

fn required_payload(body: &EnvelopeBody) -> Result<&[u8]> {
    body.payload
        .as_deref()
        .ok_or_else(|| ProtocolError::MissingRecord(TlvType::Payload.to_u8()).into())
}

#[cfg(test)]
mod tests {
    use strongvelope_proto::{KeyId, MessageId};

    use super::*;

    fn round_trip(record: &ManagementRecord) -> ManagementRecord {
        let bytes = record.encode().unwrap();
        ManagementRecord::decode(&Envelope::decode(&bytes).unwrap()).unwrap()
    }

    #[test]
    fn participant_added_and_removed() {
        for privilege in [Privilege::NoChange, Privilege::NotPresent, Privilege::Standard] {
            let record = ManagementRecord {
                msg_type: MessageType::AlterParticipants,
                invitor: Some(UserId(5)),
                payload: ManagementPayload::Info(ManagementInfo { target: UserId(6), privilege }),
            };
            assert_eq!(round_trip(&record), record);
        }
    }

    #[test]
    fn privilege_change_requires_privilege() {
        let record = ManagementRecord {
            msg_type: MessageType::PrivChange,
            invitor: None,
            payload: ManagementPayload::Info(ManagementInfo {
                target: UserId(6),
                privilege: Privilege::Moderator,
            }),
        };
        assert_eq!(round_trip(&record), record);

        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::IncParticipant, &UserId(6).to_be_bytes()).unwrap();
        let mut bytes = vec![3, EnvelopeType::PrivChange.to_u8()];
        bytes.extend_from_slice(w.as_bytes());
        let err = ManagementRecord::decode(&Envelope::decode(&bytes).unwrap()).unwrap_err();
        assert_eq!(err.encryption_status(), strongvelope_proto::EncryptionStatus::Malformed);
    }

    #[test]
    fn alter_with_two_targets_rejected() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::IncParticipant, &UserId(6).to_be_bytes()).unwrap();
        w.write(TlvType::ExcParticipant, &UserId(7).to_be_bytes()).unwrap();
        let mut bytes = vec![3, EnvelopeType::AlterParticipants.to_u8()];
        bytes.extend_from_slice(w.as_bytes());

        assert!(ManagementRecord::decode(&Envelope::decode(&bytes).unwrap()).is_err());
    }

    #[test]
    fn call_ended_and_truncate() {
        let call = ManagementRecord {
            msg_type: MessageType::CallEnded,
            invitor: Some(UserId(5)),
            payload: ManagementPayload::CallEnded(CallEndedInfo {
                call_id: 77,
                duration: 12,
                term_code: 1,
            }),
        };
        assert_eq!(round_trip(&call), call);

        let truncate = ManagementRecord {
            msg_type: MessageType::Truncate,
            invitor: Some(UserId(5)),
            payload: ManagementPayload::Empty,
        };
        assert_eq!(round_trip(&truncate), truncate);
    }

    #[test]
    fn unknown_type_is_transient() {
        let err = ManagementRecord::decode(&Envelope::decode(&[3, 0x42]).unwrap()).unwrap_err();
        assert_eq!(err, ClientError::UnknownManagementType(0x42));
        assert!(err.is_transient());
    }

    #[test]
    fn apply_sets_sender_and_payload() {
        let record = ManagementRecord {
            msg_type: MessageType::AlterParticipants,
            invitor: Some(UserId(5)),
            payload: ManagementPayload::Info(ManagementInfo {
                target: UserId(6),
                privilege: Privilege::NotPresent,
            }),
        };
        let mut msg = Message::new_incoming(MessageId(1), UserId::API, 10, 0, KeyId::INVALID);
        record.apply_to(&mut msg);

        assert_eq!(msg.sender, UserId(5));
        assert!(msg.is_management());
        assert_eq!(msg.management_info().unwrap().target, UserId(6));
    }
}
