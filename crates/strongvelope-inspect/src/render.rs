//! Human-readable rendering of decoded wire data.

use std::fmt::{self, Write};

use strongvelope_client::{ManagementPayload, ManagementRecord};
use strongvelope_proto::{
    Command, Envelope, EnvelopeBody, EnvelopeType, KeyBlobs, ProtocolError, TlvMode, TlvReader,
    TlvType, UserId,
};
use thiserror::Error;

/// Errors while inspecting input
#[derive(Error, Debug)]
pub enum InspectError {
    /// Input is not hex
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Input does not decode
    #[error("decode failed at byte {offset}: {source}")]
    Decode {
        /// Offset of the failing item
        offset: usize,
        /// Underlying error
        source: ProtocolError,
    },

    /// Writing the report failed
    #[error("formatting failed")]
    Format(#[from] fmt::Error),
}

fn decode_at(offset: usize) -> impl FnOnce(ProtocolError) -> InspectError {
    move |source| InspectError::Decode { offset, source }
}

/// Render every command in a concatenated command stream
pub fn commands(bytes: &[u8]) -> Result<String, InspectError> {
    let mut out = String::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let rest = bytes.get(offset..).unwrap_or_default();
        let (command, consumed) = Command::decode(rest).map_err(decode_at(offset))?;
        write!(out, "@{offset:<6} ")?;
        command_line(&mut out, &command)?;
        offset += consumed;
    }
    Ok(out)
}

fn command_line(out: &mut String, command: &Command) -> fmt::Result {
    match command {
        Command::Message(msg) => {
            writeln!(
                out,
                "{:?} chat={} user={} msg={} ts={} updated={} key={} payload={}B",
                msg.opcode,
                msg.chat_id,
                msg.user_id,
                msg.msg_id,
                msg.timestamp,
                msg.updated,
                msg.key_id,
                msg.payload.len()
            )
        },
        Command::Key(key) => {
            writeln!(out, "NewKey chat={} key={} blobs={}B", key.chat_id, key.key_id, key.blob_len())?;
            blobs(out, key.blobs())
        },
        Command::KeyId(confirm) => writeln!(
            out,
            "NewKeyId chat={} local={} assigned={}",
            confirm.chat_id, confirm.local_id, confirm.key_id
        ),
        Command::MsgId(confirm) => {
            writeln!(out, "NewMsgId tx={} msg={}", confirm.transaction_id, confirm.msg_id)
        },
        Command::AlreadySent(ack) => {
            writeln!(out, "MsgId tx={} msg={}", ack.transaction_id, ack.msg_id)
        },
        Command::Reaction(reaction) => writeln!(
            out,
            "{:?} chat={} user={} msg={} text={:?}",
            reaction.opcode, reaction.chat_id, reaction.user_id, reaction.msg_id, reaction.reaction
        ),
    }
}

fn blobs(out: &mut String, blobs: &KeyBlobs) -> fmt::Result {
    for entry in blobs.iter() {
        match entry {
            Ok((user, wrapped)) => writeln!(out, "    to {user}: {}", hex::encode(wrapped))?,
            Err(error) => writeln!(out, "    malformed entry: {error}")?,
        }
    }
    Ok(())
}

/// Render a message envelope, including management content from the API
pub fn envelope(bytes: &[u8]) -> Result<String, InspectError> {
    let envelope = Envelope::decode(bytes).map_err(decode_at(0))?;
    let raw_type = envelope.envelope_type();

    let mut out = String::new();
    writeln!(out, "version    {:?}", envelope.version())?;
    match EnvelopeType::from_u8(raw_type) {
        Some(known) => writeln!(out, "type       {known:?}")?,
        None => writeln!(out, "type       unknown ({raw_type:#04x})")?,
    }
    match envelope.signature() {
        Some(signature) => writeln!(out, "signature  {}", hex::encode(signature))?,
        None => writeln!(out, "signature  none")?,
    }
    if let Some(key_id) = envelope.embedded_key_id() {
        writeln!(out, "key id     {key_id}")?;
    }
    body(&mut out, envelope.body())?;

    if envelope.signature().is_none() {
        match ManagementRecord::decode(&envelope) {
            Ok(record) => management(&mut out, &record)?,
            Err(error) => writeln!(out, "management undecodable: {error}")?,
        }
    }
    Ok(out)
}

fn body(out: &mut String, body: &EnvelopeBody) -> fmt::Result {
    if let Some(nonce) = &body.nonce {
        writeln!(out, "nonce      {}", hex::encode(nonce))?;
    }
    if let Some(payload) = &body.payload {
        writeln!(out, "payload    {}B", payload.len())?;
    }
    users(out, "added", &body.inc_participants)?;
    users(out, "removed", &body.exc_participants)?;
    if let Some(invitor) = body.invitor {
        writeln!(out, "invitor    {invitor}")?;
    }
    if let Some(privilege) = body.privilege {
        writeln!(out, "privilege  {privilege}")?;
    }
    if let Some(raw) = &body.key_blobs {
        writeln!(out, "key blobs  {}B", raw.len())?;
        blobs(out, &KeyBlobs::from_raw(raw.clone()))?;
    }
    Ok(())
}

fn users(out: &mut String, label: &str, users: &[UserId]) -> fmt::Result {
    for user in users {
        writeln!(out, "{label:<10} {user}")?;
    }
    Ok(())
}

fn management(out: &mut String, record: &ManagementRecord) -> fmt::Result {
    writeln!(out, "management {:?}", record.msg_type)?;
    match &record.payload {
        ManagementPayload::Empty => Ok(()),
        ManagementPayload::Info(info) => {
            writeln!(out, "  target {} privilege {:?}", info.target, info.privilege)
        },
        ManagementPayload::CallEnded(info) => writeln!(
            out,
            "  call {:#x} lasted {}s, termination code {}",
            info.call_id, info.duration, info.term_code
        ),
        ManagementPayload::Title(blob) => writeln!(out, "  encrypted title {}B", blob.len()),
    }
}

/// Render raw TLV records starting at `offset`
pub fn records(bytes: &[u8], offset: usize, legacy: bool) -> Result<String, InspectError> {
    let mode = if legacy { TlvMode::Legacy } else { TlvMode::Current };
    let mut reader = TlvReader::new(bytes, offset, mode);
    let mut out = String::new();
    loop {
        let position = reader.position();
        let Some(record) = reader.next() else {
            break;
        };
        let record = record.map_err(decode_at(position))?;
        let name = match TlvType::from_u8(record.record_type) {
            Some(known) => format!("{known:?}"),
            None => format!("{:#04x}", record.record_type),
        };
        writeln!(out, "@{position:<6} {name:<16} {}", hex::encode(record.value))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use strongvelope_proto::{
        ChatId, KeyCommand, KeyId, ManagementInfo, MessageId, MessageType, MsgCommand, Opcode,
        Privilege, TlvWriter,
    };

    use super::*;

    #[test]
    fn command_stream_lists_each_command() {
        let mut wire = Vec::new();
        let mut key = KeyCommand::new(ChatId(1), KeyId(2));
        key.add_recipient(UserId(3), &[0xAB; 16]).unwrap();
        Command::Key(key).encode(&mut wire).unwrap();
        let msg = MsgCommand::new(Opcode::NewMsg, ChatId(1), UserId(3), MessageId(4), 5);
        Command::Message(msg).encode(&mut wire).unwrap();

        let text = commands(&wire).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("NewKey"));
        assert!(lines[1].contains(&"ab".repeat(16)));
        assert!(lines[2].contains("NewMsg"));
    }

    #[test]
    fn truncated_stream_reports_offset() {
        let mut wire = Vec::new();
        let msg = MsgCommand::new(Opcode::NewMsg, ChatId(1), UserId(3), MessageId(4), 5);
        Command::Message(msg).encode(&mut wire).unwrap();
        let first = wire.len();
        wire.extend_from_slice(&[Opcode::NewMsg.to_u8(), 0, 0]);

        let err = commands(&wire).unwrap_err();
        assert!(matches!(err, InspectError::Decode { offset, .. } if offset == first));
    }

    #[test]
    fn management_envelope_is_explained() {
        let record = ManagementRecord {
            msg_type: MessageType::AlterParticipants,
            invitor: Some(UserId(5)),
            payload: ManagementPayload::Info(ManagementInfo {
                target: UserId(6),
                privilege: Privilege::NotPresent,
            }),
        };
        let text = envelope(&record.encode().unwrap()).unwrap();

        assert!(text.contains("AlterParticipants"));
        assert!(text.contains("signature  none"));
        assert!(text.contains("target"));
    }

    #[test]
    fn records_name_known_types() {
        let mut w = TlvWriter::new(TlvMode::Current);
        w.write(TlvType::Invitor, &UserId(5).to_be_bytes()).unwrap();
        let text = records(w.as_bytes(), 0, false).unwrap();
        assert!(text.contains("Invitor"));
    }
}
