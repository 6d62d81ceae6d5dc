//! Chat title encryption.
//!
//! A title travels as a self-contained envelope under its own single-use
//! key. The key is wrapped for every participant into a `KEY_BLOB` record, so
//! any member can decrypt the title without a key command round trip.

use strongvelope_crypto::{CryptoBackend, SendKey, signing_data};
use strongvelope_proto::{
    CurrentEnvelope, EnvelopeType, KeyBlobs, KeyId, ProtocolError, ProtocolVersion, TlvMode,
    TlvType, TlvWriter, UserId, find_wrapped_key,
};
use tracing::debug;

use crate::{
    directory::PublicKeyDirectory,
    env::Environment,
    error::{ClientError, Result},
    keyring::Keyring,
};

/// Output of [`encrypt_title`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedTitle {
    /// Title envelope
    pub blob: Vec<u8>,
    /// Participants the title key could not be wrapped for
    pub failed_recipients: Vec<(UserId, ClientError)>,
}

/// Encrypt `title` for `recipients` under a fresh key
pub(crate) async fn encrypt_title<E, B, D>(
    keyring: &Keyring<B, D>,
    env: &E,
    recipients: impl IntoIterator<Item = UserId>,
    title: &str,
) -> Result<EncryptedTitle>
where
    E: Environment,
    B: CryptoBackend,
    D: PublicKeyDirectory,
{
    let key = env.random_send_key();
    let nonce = env.random_nonce();

    let (wrapped, failed_recipients) = keyring.wrap_for_all(&key, recipients).await;
    let mut blobs = KeyBlobs::new();
    for (recipient, blob) in &wrapped {
        blobs.push(*recipient, blob)?;
    }

    let ciphertext = keyring.backend().encrypt_payload(&key, &nonce, title.as_bytes());
    let mut records = TlvWriter::new(TlvMode::Current);
    records
        .write(TlvType::Nonce, &nonce)?
        .write(TlvType::Payload, &ciphertext)?
        .write(TlvType::KeyBlob, blobs.as_bytes())?;

    let blob = seal(keyring, &key, records.as_bytes())?;
    debug!(recipients = wrapped.len(), failed = failed_recipients.len(), "title encrypted");
    Ok(EncryptedTitle { blob, failed_recipients })
}

fn seal<B, D>(keyring: &Keyring<B, D>, key: &SendKey, signed: &[u8]) -> Result<Vec<u8>>
where
    B: CryptoBackend,
    D: PublicKeyDirectory,
{
    let version = ProtocolVersion::CURRENT;
    let envelope_type = EnvelopeType::ChatTitle.to_u8();
    let signature = keyring.backend().sign(&signing_data(version.to_u8(), envelope_type, key, signed));
    Ok(CurrentEnvelope::seal(version, envelope_type, &signature, signed)?)
}

/// Decrypt a title envelope written by `author`
pub(crate) async fn decrypt_title<B, D>(
    keyring: &Keyring<B, D>,
    own: UserId,
    author: UserId,
    blob: &[u8],
) -> Result<String>
where
    B: CryptoBackend,
    D: PublicKeyDirectory,
{
    let envelope = CurrentEnvelope::decode(blob)?;
    if envelope.envelope_type != EnvelopeType::ChatTitle.to_u8() {
        return Err(ProtocolError::MalformedManagement("not a title envelope").into());
    }
    let signature =
        envelope.signature.ok_or(ProtocolError::MissingRecord(TlvType::Signature.to_u8()))?;
    let body = &envelope.body;
    let nonce = body.nonce.ok_or(ProtocolError::MissingRecord(TlvType::Nonce.to_u8()))?;
    let ciphertext =
        body.payload.as_deref().ok_or(ProtocolError::MissingRecord(TlvType::Payload.to_u8()))?;
    let blobs =
        body.key_blobs.as_deref().ok_or(ProtocolError::MissingRecord(TlvType::KeyBlob.to_u8()))?;

    let wrapped = find_wrapped_key(blobs, own)?
        .ok_or(ClientError::NotARecipient { owner: author, key_id: KeyId::INVALID })?;
    let (key, signer) =
        futures::try_join!(keyring.unwrap_from(wrapped, author), keyring.signing_key(author))?;

    let data =
        signing_data(envelope.version.to_u8(), envelope.envelope_type, &key, &envelope.signed_content);
    keyring.backend().verify(&signer, &data, &signature)?;

    let plaintext = keyring.backend().decrypt_payload(&key, &nonce, ciphertext);
    String::from_utf8(plaintext)
        .map_err(|_| ProtocolError::MalformedPlaintext("title is not UTF-8").into())
}
