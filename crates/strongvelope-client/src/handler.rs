//! Per-chat protocol handler.
//!
//! Ties the key store, the keyring and the wire codecs together. Everything
//! runs on one thread: state lives behind `Rc<RefCell<..>>` and no borrow is
//! held across an await point.
//!
//! # Decrypt flow
//!
//! ```text
//! MsgCommand ─▶ Envelope::decode ─┬─ API sender, key 0 ─▶ ManagementRecord
//!                                 ├─ CHAT_TITLE ─────────▶ decrypt_title
//!                                 └─ content ─▶ resolve key ┐
//!                                              signing key ─┴▶ verify ─▶ decrypt ─▶ Plaintext
//! ```
//!
//! Decrypt never fails outright. Errors become the message's
//! [`EncryptionStatus`], and transient failures keep the raw envelope in the
//! payload so the caller can retry later.

use std::{
    cell::RefCell,
    collections::BTreeSet,
    rc::{Rc, Weak},
};

use bytes::Bytes;
use futures::future::{FutureExt, LocalBoxFuture};
use strongvelope_crypto::{CryptoBackend, SendKey, legacy_signing_data, signing_data};
use strongvelope_proto::{
    CallEndedInfo, ChatId, CurrentEnvelope, EncryptionStatus, Envelope, EnvelopeType, KeyCommand,
    KeyId, LegacyEnvelope, ManagementInfo, Message, MessageType, MsgCommand, Opcode, Plaintext,
    ProtocolError, ProtocolVersion, TlvMode, TlvType, TlvWriter, UserId,
};
use tracing::{debug, warn};

use crate::{
    config::HandlerConfig,
    directory::PublicKeyDirectory,
    env::Environment,
    error::{ClientError, Result},
    key_cache::KeyCache,
    key_store::{CurrentKey, KeyResolution, KeyStore, RotationState},
    keyring::Keyring,
    management::{ManagementPayload, ManagementRecord},
    title::{self, EncryptedTitle},
};

/// Commands produced by [`ProtocolHandler::encrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptOutput {
    /// Message command carrying the envelope
    pub command: MsgCommand,
    /// Announcement of a newly created key. Must be sent before `command`.
    pub key_command: Option<KeyCommand>,
    /// Recipients the new key could not be wrapped for. They cannot decrypt
    /// until the key is delivered again.
    pub failed_recipients: Vec<(UserId, ClientError)>,
}

/// Follow-up key command for participants an announcement missed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDelivery {
    /// Key command under the key's permanent id
    pub key_command: KeyCommand,
    /// Recipients the key could not be wrapped for
    pub failed_recipients: Vec<(UserId, ClientError)>,
}

/// Withdraws the announcement of a created key unless its key command was
/// handed to the caller. Dropping an encrypt future part way also withdraws.
struct Announcement<'a, C: KeyCache> {
    store: &'a RefCell<KeyStore<C>>,
    key: Option<SendKey>,
}

impl<C: KeyCache> Announcement<'_, C> {
    fn delivered(mut self) {
        self.key = None;
    }
}

impl<C: KeyCache> Drop for Announcement<'_, C> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take()
            && let Ok(mut store) = self.store.try_borrow_mut()
        {
            store.retract_announcement(&key);
        }
    }
}

/// Encrypts and decrypts the messages of one chat for the local user.
pub struct ProtocolHandler<E, B, D, C> {
    own: UserId,
    chat: ChatId,
    env: E,
    version: ProtocolVersion,
    keyring: Rc<Keyring<B, D>>,
    store: Rc<RefCell<KeyStore<C>>>,
}

impl<E, B, D, C> ProtocolHandler<E, B, D, C>
where
    E: Environment,
    B: CryptoBackend + 'static,
    D: PublicKeyDirectory,
    C: KeyCache,
{
    /// Create a handler, warm-starting the key store from `cache`.
    ///
    /// # Errors
    ///
    /// - `Cache` if the cached keys cannot be loaded
    pub fn new(
        own: UserId,
        chat: ChatId,
        env: E,
        backend: B,
        directory: D,
        cache: Rc<C>,
        config: HandlerConfig,
    ) -> Result<Self> {
        let store = KeyStore::open(chat, own, cache)?;
        Ok(Self {
            own,
            chat,
            env,
            version: config.protocol_version,
            keyring: Rc::new(Keyring::new(backend, directory, &config)),
            store: Rc::new(RefCell::new(store)),
        })
    }

    /// Local user
    pub fn own_user(&self) -> UserId {
        self.own
    }

    /// Chat this handler serves
    pub fn chat(&self) -> ChatId {
        self.chat
    }

    /// Encrypt an outgoing message or edit.
    ///
    /// A message without a key id takes the current key, which may be newly
    /// created; its id is written back to `msg.key_id` once encryption
    /// succeeds. An edit keeps the key of the original message, and an edit
    /// of a message still awaiting its permanent id goes out as `MsgUpdX`.
    /// An edit with an empty payload deletes the message and carries no
    /// envelope.
    ///
    /// If a new key cannot be announced, because this call fails or its
    /// future is dropped, the next call announces the same key again.
    ///
    /// # Errors
    ///
    /// - `UnknownOwnKey` if `msg.key_id` names a key we do not hold
    /// - `Protocol` if the payload cannot be framed
    pub async fn encrypt(&self, msg: &mut Message) -> Result<EncryptOutput> {
        let current = if msg.key_id == KeyId::INVALID {
            self.store.borrow_mut().current_key(&self.env)
        } else {
            let key = self
                .store
                .borrow()
                .get(self.own, msg.key_id)
                .ok_or(ClientError::UnknownOwnKey(msg.key_id))?;
            CurrentKey::Existing { key_id: msg.key_id, key }
        };
        let announcement = match &current {
            CurrentKey::Created { key, .. } => {
                Some(Announcement { store: &*self.store, key: Some(key.clone()) })
            },
            CurrentKey::Existing { .. } => None,
        };
        let key_id = current.key_id();

        let opcode = match (msg.is_sending(), msg.updated) {
            (true, 0) => Opcode::NewMsg,
            (true, _) => Opcode::MsgUpdX,
            (false, _) => Opcode::MsgUpd,
        };
        let mut command = MsgCommand::new(opcode, self.chat, self.own, msg.id(), msg.timestamp);
        command.updated = msg.updated;
        command.key_id = key_id;
        if !msg.is_deleted() {
            command.payload = Bytes::from(self.seal(msg, key_id, current.key())?);
        }

        let (key_command, failed_recipients) = match current {
            CurrentKey::Created { key, recipients } => {
                let (command, failed) = self.wrap_key(&key, KeyId::UNCONFIRMED, recipients).await?;
                (Some(command), failed)
            },
            CurrentKey::Existing { .. } => (None, Vec::new()),
        };
        if let Some(announcement) = announcement {
            announcement.delivered();
        }
        msg.key_id = key_id;

        debug!(
            chat = %self.chat,
            msg_id = %msg.id(),
            key_id = %msg.key_id,
            ?opcode,
            new_key = key_command.is_some(),
            "message encrypted"
        );
        Ok(EncryptOutput { command, key_command, failed_recipients })
    }

    /// Wrap `key` for each of `recipients` into a key command under `key_id`
    async fn wrap_key(
        &self,
        key: &SendKey,
        key_id: KeyId,
        recipients: BTreeSet<UserId>,
    ) -> Result<(KeyCommand, Vec<(UserId, ClientError)>)> {
        let (wrapped, failed) = self.keyring.wrap_for_all(key, recipients).await;

        let mut command = KeyCommand::new(self.chat, key_id);
        for (recipient, blob) in &wrapped {
            command.add_recipient(*recipient, blob)?;
        }
        Ok((command, failed))
    }

    fn seal(&self, msg: &Message, key_id: KeyId, key: &SendKey) -> Result<Vec<u8>> {
        let backend = self.keyring.backend();
        let plaintext = Plaintext {
            backref_id: msg.backref_id,
            backrefs: msg.backrefs.clone(),
            content: msg.payload.clone(),
        }
        .encode(self.version.backref_framing())?;
        let nonce = self.env.random_nonce();
        let ciphertext = backend.encrypt_payload(key, &nonce, &plaintext);
        let envelope_type = match msg.msg_type {
            MessageType::Truncate => EnvelopeType::Truncate,
            _ => EnvelopeType::Followup,
        };

        match self.version {
            ProtocolVersion::V1 => {
                let mut records = TlvWriter::new(TlvMode::Legacy);
                records
                    .write(TlvType::MessageType, &[envelope_type.to_u8()])?
                    .write(TlvType::Nonce, &nonce)?
                    .write(TlvType::KeyIds, &LegacyEnvelope::key_ids_value(key_id, None))?
                    .write(TlvType::Payload, &ciphertext)?;
                let signature = backend.sign(&legacy_signing_data(records.as_bytes()));
                Ok(LegacyEnvelope::seal(&signature, records.as_bytes())?)
            },
            ProtocolVersion::V2 | ProtocolVersion::V3 => {
                let mut records = TlvWriter::new(TlvMode::Current);
                records.write(TlvType::Nonce, &nonce)?.write(TlvType::Payload, &ciphertext)?;
                let data = signing_data(
                    self.version.to_u8(),
                    envelope_type.to_u8(),
                    key,
                    records.as_bytes(),
                );
                let signature = backend.sign(&data);
                Ok(CurrentEnvelope::seal(
                    self.version,
                    envelope_type.to_u8(),
                    &signature,
                    records.as_bytes(),
                )?)
            },
        }
    }

    /// Decrypt a received message command.
    ///
    /// Waits for the key if its key command has not been processed yet.
    pub async fn decrypt(&self, command: &MsgCommand) -> Message {
        let mut msg = Message::new_incoming(
            command.msg_id,
            command.user_id,
            command.timestamp,
            command.updated,
            command.key_id,
        );
        if command.payload.is_empty() {
            msg.set_encryption_status(EncryptionStatus::Decrypted);
            return msg;
        }

        match self.open(command, &mut msg).await {
            Ok(()) => {
                msg.set_encryption_status(EncryptionStatus::Decrypted);
                debug!(chat = %self.chat, msg_id = %command.msg_id, msg_type = ?msg.msg_type, "message decrypted");
            },
            Err(error) => {
                let status = error.encryption_status();
                msg.mark_undecryptable(status);
                if error.is_transient() {
                    msg.payload = command.payload.to_vec();
                }
                warn!(
                    chat = %self.chat,
                    msg_id = %command.msg_id,
                    sender = %command.user_id,
                    ?status,
                    %error,
                    "message not decrypted"
                );
            },
        }
        msg
    }

    async fn open(&self, command: &MsgCommand, msg: &mut Message) -> Result<()> {
        let envelope = Envelope::decode(&command.payload)?;
        if command.user_id.is_api() && command.key_id == KeyId::INVALID {
            return self.open_management(&envelope, msg).await;
        }

        let raw_type = envelope.envelope_type();
        let content_type = match EnvelopeType::from_u8(raw_type) {
            Some(EnvelopeType::Keyed) => return Err(ClientError::LegacyKeyedMessage),
            Some(EnvelopeType::ChatTitle) => {
                let title =
                    title::decrypt_title(&self.keyring, self.own, command.user_id, &command.payload)
                        .await?;
                msg.msg_type = MessageType::ChatTitle;
                msg.payload = title.into_bytes();
                return Ok(());
            },
            Some(EnvelopeType::Followup) => MessageType::Normal,
            Some(EnvelopeType::Truncate) => MessageType::Truncate,
            Some(EnvelopeType::AlterParticipants) => MessageType::AlterParticipants,
            Some(EnvelopeType::PrivChange) => MessageType::PrivChange,
            Some(EnvelopeType::CallEnded) => MessageType::CallEnded,
            Some(EnvelopeType::CallStarted) => MessageType::CallStarted,
            None => return Err(ClientError::UnknownManagementType(raw_type)),
        };

        // v1 envelopes embed the key id; an unconfirmed one was rebound in
        // the command after the server assigned the real id
        let key_id = match envelope.embedded_key_id() {
            Some(embedded) if embedded.is_confirmed() => embedded,
            _ => command.key_id,
        };
        if key_id == KeyId::INVALID {
            return Err(ClientError::InvalidKeyId(key_id));
        }
        msg.key_id = key_id;

        let resolution = self.store.borrow_mut().resolve(command.user_id, key_id);
        let key = async move {
            match resolution {
                KeyResolution::Ready(key) => Ok(key),
                KeyResolution::Pending(pending) => pending.await,
            }
        };
        let (key, signer) = futures::try_join!(key, self.keyring.signing_key(command.user_id))?;

        let signature = envelope
            .signature()
            .ok_or(ProtocolError::MissingRecord(TlvType::Signature.to_u8()))?;
        let data = match &envelope {
            Envelope::Legacy(legacy) => legacy_signing_data(&legacy.signed_content),
            Envelope::Current(current) => signing_data(
                current.version.to_u8(),
                current.envelope_type,
                &key,
                &current.signed_content,
            ),
        };
        let backend = self.keyring.backend();
        backend.verify(&signer, &data, signature)?;

        let body = envelope.body();
        let nonce = body.nonce.ok_or(ProtocolError::MissingRecord(TlvType::Nonce.to_u8()))?;
        let ciphertext =
            body.payload.as_deref().ok_or(ProtocolError::MissingRecord(TlvType::Payload.to_u8()))?;
        let plaintext = Plaintext::decode(
            &backend.decrypt_payload(&key, &nonce, ciphertext),
            envelope.version().backref_framing(),
        )?;

        msg.msg_type = match content_type {
            MessageType::Normal => MessageType::from_content(&plaintext.content),
            MessageType::CallEnded => {
                CallEndedInfo::from_bytes(&plaintext.content)?;
                content_type
            },
            MessageType::AlterParticipants | MessageType::PrivChange => {
                ManagementInfo::from_bytes(&plaintext.content)?;
                content_type
            },
            other => other,
        };
        msg.backref_id = plaintext.backref_id;
        msg.backrefs = plaintext.backrefs;
        msg.payload = plaintext.content;
        Ok(())
    }

    async fn open_management(&self, envelope: &Envelope, msg: &mut Message) -> Result<()> {
        let record = ManagementRecord::decode(envelope)?;
        record.apply_to(msg);
        if let ManagementPayload::Title(blob) = &record.payload {
            let author =
                record.invitor.ok_or(ProtocolError::MissingRecord(TlvType::Invitor.to_u8()))?;
            msg.payload = title::decrypt_title(&self.keyring, self.own, author, blob)
                .await?
                .into_bytes();
        }
        Ok(())
    }

    /// Unwrap a key addressed to us and make it available for decryption.
    ///
    /// The returned future holds only a weak reference to the key store: if
    /// the handler is dropped first, it completes without doing anything.
    /// Repeated deliveries of the same key are unwrapped once.
    pub fn on_key_received(
        &self,
        owner: UserId,
        key_id: KeyId,
        wrapped: Vec<u8>,
    ) -> LocalBoxFuture<'static, ()> {
        let store: Weak<RefCell<KeyStore<C>>> = Rc::downgrade(&self.store);
        let keyring = Rc::clone(&self.keyring);

        async move {
            {
                let Some(store) = store.upgrade() else {
                    debug!(%owner, %key_id, "handler dropped before unwrap");
                    return;
                };
                if !store.borrow_mut().begin_unwrap(owner, key_id) {
                    return;
                }
            }

            let result = keyring.unwrap_from(&wrapped, owner).await;

            let Some(store) = store.upgrade() else {
                debug!(%owner, %key_id, "handler dropped during unwrap");
                return;
            };
            let mut store = store.borrow_mut();
            match result {
                Ok(key) => {
                    if let Err(error) = store.add_key(owner, key_id, key) {
                        warn!(%owner, %key_id, %error, "received key conflicts with stored key");
                    }
                },
                Err(error) if error.is_transient() => {
                    debug!(%owner, %key_id, %error, "unwrap deferred");
                    store.abort_unwrap(owner, key_id);
                },
                Err(error) => store.reject(owner, key_id, error),
            }
        }
        .boxed_local()
    }

    /// Handle a key command from `owner`: find our entry and unwrap it.
    ///
    /// # Errors
    ///
    /// - `NotARecipient` if the command has no entry for the local user
    /// - `Protocol` if the recipient list is malformed
    pub fn on_key_command(
        &self,
        owner: UserId,
        command: &KeyCommand,
    ) -> Result<LocalBoxFuture<'static, ()>> {
        let wrapped = command
            .wrapped_key_for(self.own)?
            .ok_or(ClientError::NotARecipient { owner, key_id: command.key_id })?;
        Ok(self.on_key_received(owner, command.key_id, wrapped.to_vec()))
    }

    /// Server assigned `assigned` to our unconfirmed key `local`.
    ///
    /// Messages in `queued` that were encrypted under `local` are rebound to
    /// the permanent id. If participants joined after the key was announced,
    /// the key is wrapped for them into a follow-up key command under
    /// `assigned`. Send it so they can read the messages the key encrypted.
    ///
    /// # Errors
    ///
    /// - `NoUnconfirmedKey`, `InvalidKeyId` or `KeyMismatch` from the store
    /// - `Protocol` if the follow-up key command cannot be framed
    pub async fn on_key_confirmed(
        &self,
        local: KeyId,
        assigned: KeyId,
        queued: &mut [Message],
    ) -> Result<Option<KeyDelivery>> {
        let confirmed = self.store.borrow_mut().confirm(local, assigned)?;
        let rebound =
            queued.iter_mut().map(|msg| msg.rebind_key(local, assigned)).filter(|hit| *hit).count();
        debug!(chat = %self.chat, %local, %assigned, rebound, "queued messages rebound");

        if confirmed.unreached.is_empty() {
            return Ok(None);
        }
        let unreached = confirmed.unreached.len();
        let (key_command, failed_recipients) =
            self.wrap_key(&confirmed.key, assigned, confirmed.unreached).await?;
        debug!(chat = %self.chat, key_id = %assigned, unreached, "follow-up key delivery");
        Ok(Some(KeyDelivery { key_command, failed_recipients }))
    }

    /// Encrypt a new chat title for all participants and ourselves
    ///
    /// # Errors
    ///
    /// - `Protocol` if the wrapped keys exceed the blob limits
    pub async fn encrypt_chat_title(&self, title: &str) -> Result<EncryptedTitle> {
        let recipients = self.store.borrow().recipients();
        title::encrypt_title(&self.keyring, &self.env, recipients, title).await
    }

    /// Decrypt a title envelope written by `author`
    ///
    /// # Errors
    ///
    /// - `NotARecipient` if the title was not wrapped for us
    /// - `Crypto(BadSignature)` if the signature does not verify
    pub async fn decrypt_chat_title(&self, author: UserId, blob: &[u8]) -> Result<String> {
        title::decrypt_title(&self.keyring, self.own, author, blob).await
    }

    /// Current participants, excluding ourselves unless added explicitly
    pub fn participants(&self) -> BTreeSet<UserId> {
        self.store.borrow().participants().clone()
    }

    /// Replace the participant set
    pub fn set_participants(&self, participants: impl IntoIterator<Item = UserId>) {
        self.store.borrow_mut().set_participants(participants);
    }

    /// A user joined
    pub fn add_participant(&self, user: UserId) {
        self.store.borrow_mut().add_participant(user);
    }

    /// A user left
    pub fn remove_participant(&self, user: UserId) {
        self.store.borrow_mut().remove_participant(user);
    }

    /// Rotation state of the send key
    pub fn key_state(&self) -> RotationState {
        self.store.borrow().state()
    }

    /// Whether a created key awaits confirmation
    pub fn has_unconfirmed_key(&self) -> bool {
        self.store.borrow().has_unconfirmed()
    }
}
