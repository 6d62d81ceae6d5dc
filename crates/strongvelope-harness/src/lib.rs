//! Deterministic simulation harness for strongvelope protocol testing.
//!
//! In-memory implementations of the collaborators a protocol handler needs,
//! all seeded or scripted so runs are reproducible:
//!
//! - [`SeededEnv`]: `ChaCha8` randomness
//! - [`MemoryDirectory`]: public key directory with failure injection
//! - [`MemoryKeyCache`]: key cache that survives handler restarts
//! - [`TestUser`]: users with seeded long-term keys
//! - [`SimRelay`]: chat server assigning permanent key and message ids
//!
//! # Model-Based Testing
//!
//! The `model` module holds a reference model of key rotation. Operations
//! are applied to both the model and a real handler, and their outcomes are
//! compared.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties that must hold after any
//! operation sequence, such as unique key ids per chat.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod invariants;
pub mod key_cache;
pub mod model;
pub mod relay;
pub mod sim_env;
pub mod user;

pub use directory::MemoryDirectory;
pub use invariants::{InvariantResult, Violation};
pub use key_cache::MemoryKeyCache;
pub use model::{Operation, Outcome, PeerId, RotationModel};
pub use relay::{Receipt, Relayed, SimRelay, deliver};
pub use sim_env::SeededEnv;
pub use user::{SIM_RSA_BITS, SimHandler, TestUser};
