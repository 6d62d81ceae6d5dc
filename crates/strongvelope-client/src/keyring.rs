//! Per-session public key material: pairwise keys, signing keys, wrapping.

use std::{cell::RefCell, collections::HashMap};

use strongvelope_crypto::{
    CryptoBackend, CryptoError, PUBLIC_KEY_SIZE, PairwiseKey, RecipientKey, SendKey, WrapScheme,
    decode_rsa_public,
};
use futures::future::join_all;
use strongvelope_proto::UserId;
use tracing::{debug, warn};

use crate::{
    config::{HandlerConfig, RsaFallback},
    directory::{DirectoryError, PublicKeyDirectory, PublicKeyKind},
    error::{ClientError, Result},
};

/// Crypto backend plus directory, with caches of derived keys.
///
/// Pairwise keys are a function of two long-term keys, so each peer costs
/// at most one Curve25519 lookup per session. Ed25519 keys are cached the
/// same way.
pub(crate) struct Keyring<B, D> {
    backend: B,
    directory: D,
    force_rsa: bool,
    rsa_fallback: RsaFallback,
    pairwise: RefCell<HashMap<UserId, PairwiseKey>>,
    signing: RefCell<HashMap<UserId, [u8; PUBLIC_KEY_SIZE]>>,
}

impl<B: CryptoBackend, D: PublicKeyDirectory> Keyring<B, D> {
    pub(crate) fn new(backend: B, directory: D, config: &HandlerConfig) -> Self {
        Self {
            backend,
            directory,
            force_rsa: config.force_rsa,
            rsa_fallback: config.rsa_fallback,
            pairwise: RefCell::new(HashMap::new()),
            signing: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    /// Pairwise key shared with `peer`, fetching their Curve25519 key once
    pub(crate) async fn pairwise_key(&self, peer: UserId) -> Result<PairwiseKey> {
        if let Some(key) = self.pairwise.borrow().get(&peer) {
            return Ok(key.clone());
        }

        let public = self.directory.public_key(peer, PublicKeyKind::Cu25519).await?;
        let key = self.backend.pairwise_key(&public)?;
        self.pairwise.borrow_mut().insert(peer, key.clone());
        Ok(key)
    }

    /// Ed25519 key of `user`
    pub(crate) async fn signing_key(&self, user: UserId) -> Result<[u8; PUBLIC_KEY_SIZE]> {
        if let Some(key) = self.signing.borrow().get(&user) {
            return Ok(*key);
        }

        let public = self.directory.public_key(user, PublicKeyKind::Ed25519).await?;
        let key: [u8; PUBLIC_KEY_SIZE] = public
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey("Ed25519"))?;
        self.signing.borrow_mut().insert(user, key);
        Ok(key)
    }

    /// Wrap `key` for one recipient.
    ///
    /// Uses the pairwise scheme unless RSA is forced, falling back to RSA per
    /// the configured policy.
    pub(crate) async fn wrap_for(&self, key: &SendKey, recipient: UserId) -> Result<Vec<u8>> {
        if !self.force_rsa {
            match self.pairwise_key(recipient).await {
                Ok(pairwise) => {
                    return Ok(self.backend.wrap_key(key, RecipientKey::Pairwise(&pairwise))?);
                },
                Err(e) if self.falls_back_on(&e) => {
                    debug!(%recipient, error = %e, "pairwise wrap unavailable, using RSA");
                },
                Err(e) => return Err(e),
            }
        }

        let encoded = self.directory.public_key(recipient, PublicKeyKind::Rsa).await?;
        let public = decode_rsa_public(&encoded)?;
        Ok(self.backend.wrap_key(key, RecipientKey::Rsa(&public))?)
    }

    /// Wrap `key` for every recipient concurrently.
    ///
    /// One recipient failing does not affect the others; failures are
    /// returned alongside the successful wraps.
    pub(crate) async fn wrap_for_all(
        &self,
        key: &SendKey,
        recipients: impl IntoIterator<Item = UserId>,
    ) -> (Vec<(UserId, Vec<u8>)>, Vec<(UserId, ClientError)>) {
        let wraps = recipients.into_iter().map(|recipient| async move {
            (recipient, self.wrap_for(key, recipient).await)
        });

        let mut wrapped = Vec::new();
        let mut failed = Vec::new();
        for (recipient, result) in join_all(wraps).await {
            match result {
                Ok(blob) => wrapped.push((recipient, blob)),
                Err(error) => {
                    warn!(%recipient, %error, "key wrap failed");
                    failed.push((recipient, error));
                },
            }
        }
        (wrapped, failed)
    }

    /// Unwrap a key created by `owner` and addressed to us
    pub(crate) async fn unwrap_from(&self, wrapped: &[u8], owner: UserId) -> Result<SendKey> {
        match WrapScheme::of(wrapped) {
            WrapScheme::Symmetric => {
                let pairwise = self.pairwise_key(owner).await?;
                Ok(self.backend.unwrap_key(wrapped, Some(&pairwise))?)
            },
            WrapScheme::Rsa => Ok(self.backend.unwrap_key(wrapped, None)?),
        }
    }

    fn falls_back_on(&self, error: &ClientError) -> bool {
        match self.rsa_fallback {
            RsaFallback::AnyError => true,
            RsaFallback::MissingCurveKey => matches!(
                error,
                ClientError::Directory(DirectoryError::NotFound {
                    kind: PublicKeyKind::Cu25519,
                    ..
                })
            ),
        }
    }
}
