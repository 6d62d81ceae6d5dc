//! Simulated chat server.
//!
//! Assigns permanent key and message ids the way the real server does and
//! keeps the relayed command stream of one chat. Every command passes
//! through the wire codec on the way in, so tests exercise encode and
//! decode as well as the handler.

use std::collections::HashMap;

use strongvelope_client::{ClientError, EncryptOutput, KeyDelivery, ManagementRecord};
use strongvelope_proto::{
    ChatId, Command, KeyCommand, KeyId, KeyIdCommand, Message, MessageId, MsgCommand,
    MsgIdCommand, Opcode, ProtocolError, UserId,
};
use tracing::debug;

use crate::SimHandler;

/// Command as relayed to chat members
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relayed {
    /// Key announcement from `owner`, carrying its permanent id
    Key {
        /// User that created the key
        owner: UserId,
        /// Announcement with the permanent id
        command: KeyCommand,
    },
    /// Message with permanent message and key ids
    Message(MsgCommand),
}

/// Server replies to one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Permanent id of an announced key
    pub key_id: Option<KeyIdCommand>,
    /// Permanent id of the message
    pub msg_id: MsgIdCommand,
}

/// In-memory chat server for one chat
pub struct SimRelay {
    chat: ChatId,
    next_key_id: u32,
    next_msg_id: u64,
    latest_key: HashMap<UserId, KeyId>,
    transactions: HashMap<MessageId, MessageId>,
    assigned: Vec<(UserId, KeyId)>,
    log: Vec<Relayed>,
}

impl SimRelay {
    /// Relay for `chat`. Key ids start at 1.
    pub fn new(chat: ChatId) -> Self {
        Self {
            chat,
            next_key_id: 1,
            next_msg_id: 1,
            latest_key: HashMap::new(),
            transactions: HashMap::new(),
            assigned: Vec::new(),
            log: Vec::new(),
        }
    }

    /// Chat served
    pub fn chat(&self) -> ChatId {
        self.chat
    }

    /// Id the next announced key receives
    pub fn set_next_key_id(&mut self, key_id: KeyId) {
        self.next_key_id = key_id.0;
    }

    /// Accept the commands of one encrypt call from `sender`.
    ///
    /// The key command, if any, is relayed first under a fresh permanent id.
    /// A message still tagged with the unconfirmed id is rewritten to the
    /// sender's latest key. An edit addressed by transaction id is relayed
    /// as a plain update of the permanent id.
    pub fn submit(&mut self, sender: UserId, output: &EncryptOutput) -> Result<Receipt, ProtocolError> {
        let key_id = match &output.key_command {
            Some(announced) => {
                let Command::Key(mut command) = round_trip(&Command::Key(announced.clone()))? else {
                    return Err(ProtocolError::UnknownOpcode(Opcode::NewKey.to_u8()));
                };
                let assigned = KeyId(self.next_key_id);
                self.next_key_id += 1;
                self.latest_key.insert(sender, assigned);
                self.assigned.push((sender, assigned));
                debug!(chat = %self.chat, owner = %sender, key_id = %assigned, "key relayed");

                let confirmation =
                    KeyIdCommand { chat_id: self.chat, local_id: command.key_id, key_id: assigned };
                command.key_id = assigned;
                self.log.push(Relayed::Key { owner: sender, command });
                Some(confirmation)
            },
            None => None,
        };

        let Command::Message(mut command) = round_trip(&Command::Message(output.command.clone()))?
        else {
            return Err(ProtocolError::UnknownOpcode(output.command.opcode.to_u8()));
        };
        let transaction_id = command.msg_id;
        match command.opcode {
            Opcode::NewMsg => {
                command.msg_id = MessageId(self.next_msg_id);
                self.next_msg_id += 1;
                self.transactions.insert(transaction_id, command.msg_id);
            },
            Opcode::MsgUpdX => {
                if let Some(&msg_id) = self.transactions.get(&transaction_id) {
                    command.opcode = Opcode::MsgUpd;
                    command.msg_id = msg_id;
                }
            },
            _ => {},
        }
        if command.key_id.is_unconfirmed()
            && let Some(latest) = self.latest_key.get(&sender)
        {
            command.key_id = *latest;
        }
        let msg_id = MsgIdCommand { transaction_id, msg_id: command.msg_id };
        self.log.push(Relayed::Message(command));

        Ok(Receipt { key_id, msg_id })
    }

    /// Relay a follow-up key command. It already carries the key's
    /// permanent id, so nothing is assigned.
    pub fn submit_key(&mut self, sender: UserId, delivery: &KeyDelivery) -> Result<(), ProtocolError> {
        let Command::Key(command) = round_trip(&Command::Key(delivery.key_command.clone()))? else {
            return Err(ProtocolError::UnknownOpcode(Opcode::NewKey.to_u8()));
        };
        debug!(chat = %self.chat, owner = %sender, key_id = %command.key_id, "follow-up key relayed");
        self.log.push(Relayed::Key { owner: sender, command });
        Ok(())
    }

    /// Relay an unencrypted management message from the API sender
    pub fn submit_management(
        &mut self,
        record: &ManagementRecord,
        timestamp: u32,
    ) -> Result<MsgCommand, ClientError> {
        let msg_id = MessageId(self.next_msg_id);
        self.next_msg_id += 1;
        let mut command = MsgCommand::new(Opcode::NewMsg, self.chat, UserId::API, msg_id, timestamp);
        command.payload = record.encode()?.into();
        self.log.push(Relayed::Message(command.clone()));
        Ok(command)
    }

    /// Everything relayed so far, in order
    pub fn log(&self) -> &[Relayed] {
        &self.log
    }

    /// Relayed commands from position `cursor` on
    pub fn since(&self, cursor: usize) -> &[Relayed] {
        self.log.get(cursor..).unwrap_or_default()
    }

    /// Every (owner, permanent key id) assigned so far
    pub fn assigned_keys(&self) -> &[(UserId, KeyId)] {
        &self.assigned
    }
}

fn round_trip(command: &Command) -> Result<Command, ProtocolError> {
    let mut wire = Vec::new();
    command.encode(&mut wire)?;
    let (decoded, consumed) = Command::decode(&wire)?;
    debug_assert_eq!(consumed, wire.len());
    Ok(decoded)
}

/// Feed relayed commands to `handler` in order.
///
/// Key commands are unwrapped before the next command is handled; key
/// commands without an entry for the handler's user are skipped. Returns
/// the decrypted messages.
pub async fn deliver(handler: &SimHandler, relayed: &[Relayed]) -> Vec<Message> {
    let mut messages = Vec::new();
    for item in relayed {
        match item {
            Relayed::Key { owner, command } => {
                if let Ok(unwrap) = handler.on_key_command(*owner, command) {
                    unwrap.await;
                }
            },
            Relayed::Message(command) => messages.push(handler.decrypt(command).await),
        }
    }
    messages
}
