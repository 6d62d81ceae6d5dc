//! Seeded environment for reproducible key and nonce generation.

use std::{cell::RefCell, rc::Rc};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strongvelope_client::Environment;

/// [`Environment`] backed by a seeded `ChaCha8` stream.
///
/// Clones share one stream, so a handler and the test driving it draw from
/// the same sequence. Two environments built from the same seed produce
/// identical keys and nonces.
#[derive(Clone)]
pub struct SeededEnv {
    rng: Rc<RefCell<ChaCha8Rng>>,
}

impl SeededEnv {
    /// Environment seeded with `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(seed))) }
    }
}

impl Default for SeededEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Environment for SeededEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.borrow_mut().fill_bytes(buffer);
    }
}
