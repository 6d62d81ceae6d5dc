//! Environment abstraction for deterministic testing.
//!
//! Key generation and nonces draw randomness from an [`Environment`] so tests
//! can replay exact byte sequences with a seeded RNG while production uses
//! the OS RNG.

use strongvelope_crypto::{MASTER_NONCE_SIZE, MasterNonce, SEND_KEY_SIZE, SendKey};

/// Source of randomness.
///
/// # Invariants
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Given the same seed, a test implementation produces the same sequence
pub trait Environment: Clone + 'static {
    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Fresh send key
    fn random_send_key(&self) -> SendKey {
        let mut bytes = [0u8; SEND_KEY_SIZE];
        self.random_bytes(&mut bytes);
        SendKey::new(bytes)
    }

    /// Fresh master nonce
    fn random_nonce(&self) -> MasterNonce {
        let mut nonce = [0u8; MASTER_NONCE_SIZE];
        self.random_bytes(&mut nonce);
        nonce
    }
}

/// Production environment backed by the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A client without working entropy would
/// generate predictable send keys, so there is nothing safe to fall back to.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys would be predictable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_random_bytes_are_random() {
        let env = SystemEnv::new();

        let mut bytes1 = [0u8; 32];
        let mut bytes2 = [0u8; 32];
        env.random_bytes(&mut bytes1);
        env.random_bytes(&mut bytes2);

        assert_ne!(bytes1, bytes2, "Random bytes should differ");
    }

    #[test]
    fn system_env_keys_differ() {
        let env = SystemEnv::new();
        assert_ne!(env.random_send_key(), env.random_send_key());
        assert_ne!(env.random_nonce(), env.random_nonce());
    }
}
