//! Simulated chat users with deterministic long-term keys.

use std::rc::Rc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use strongvelope_client::{ClientError, HandlerConfig, ProtocolHandler, PublicKeyKind};
use strongvelope_crypto::{Identity, IdentityBackend, PublicIdentity, RsaPrivateKey};
use strongvelope_proto::{ChatId, UserId};

use crate::{MemoryDirectory, MemoryKeyCache, SeededEnv};

/// Handler type used throughout the simulation
pub type SimHandler = ProtocolHandler<SeededEnv, IdentityBackend, MemoryDirectory, MemoryKeyCache>;

/// Modulus size of simulated RSA keys. Small to keep key generation fast.
pub const SIM_RSA_BITS: usize = 1024;

/// A user with seeded keys.
///
/// The Curve25519 and Ed25519 keys derive from `seed`; an RSA key is
/// generated on request from the same seed.
#[derive(Clone)]
pub struct TestUser {
    /// User handle
    pub id: UserId,
    seed: u8,
    rsa: Option<RsaPrivateKey>,
    publish_curve: bool,
}

impl TestUser {
    /// User `id` with keys derived from `seed`
    pub fn new(id: u64, seed: u8) -> Self {
        Self { id: UserId(id), seed, rsa: None, publish_curve: true }
    }

    /// Also hold a legacy RSA key
    ///
    /// # Panics
    ///
    /// Panics if RSA key generation fails, which a seeded RNG never causes.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_rsa(mut self) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(self.seed));
        let key = RsaPrivateKey::new(&mut rng, SIM_RSA_BITS)
            .expect("invariant: RSA generation succeeds with a working RNG");
        self.rsa = Some(key);
        self
    }

    /// Do not publish a Curve25519 key, as for accounts predating it
    #[must_use]
    pub fn without_curve_key(mut self) -> Self {
        self.publish_curve = false;
        self
    }

    /// Fresh identity for this user
    pub fn identity(&self) -> Identity {
        let mut ed_seed = [self.seed; 32];
        ed_seed[0] ^= 0xED;
        let identity = Identity::from_seeds([self.seed; 32], ed_seed);
        match &self.rsa {
            Some(rsa) => identity.with_rsa(rsa.clone()),
            None => identity,
        }
    }

    /// Public keys as published
    pub fn public(&self) -> PublicIdentity {
        self.identity().public()
    }

    /// Publish this user's keys
    pub fn register(&self, directory: &MemoryDirectory) {
        directory.publish_identity(self.id, &self.public());
        if !self.publish_curve {
            directory.unpublish(self.id, PublicKeyKind::Cu25519);
        }
    }

    /// Handler for `chat` with the default configuration
    pub fn handler(
        &self,
        chat: ChatId,
        directory: &MemoryDirectory,
        cache: &Rc<MemoryKeyCache>,
        env: &SeededEnv,
    ) -> Result<SimHandler, ClientError> {
        self.handler_with_config(chat, directory, cache, env, HandlerConfig::default())
    }

    /// Handler for `chat` with `config`
    pub fn handler_with_config(
        &self,
        chat: ChatId,
        directory: &MemoryDirectory,
        cache: &Rc<MemoryKeyCache>,
        env: &SeededEnv,
        config: HandlerConfig,
    ) -> Result<SimHandler, ClientError> {
        ProtocolHandler::new(
            self.id,
            chat,
            env.clone(),
            IdentityBackend::new(self.identity()),
            directory.clone(),
            Rc::clone(cache),
            config,
        )
    }
}
