//! Client
//!
//! Per-chat encryption state for the strongvelope protocol: the send key
//! store, key rotation, and the encrypt/decrypt orchestration around them.
//!
//! # Architecture
//!
//! A [`ProtocolHandler`] owns one chat's [`KeyStore`] and is built from
//! injected collaborators:
//!
//! - [`CryptoBackend`](strongvelope_crypto::CryptoBackend): signing, payload
//!   cipher, key wrapping
//! - [`PublicKeyDirectory`]: async lookup of users' public keys
//! - [`KeyCache`]: persistent storage of received keys
//! - [`Environment`]: randomness
//!
//! Everything is single-threaded. Suspension points are directory lookups
//! and waits for keys that have not arrived yet; continuations hold weak
//! references and become no-ops once the handler is dropped.
//!
//! # Components
//!
//! - [`ProtocolHandler`]: encrypt, decrypt, key delivery and confirmation
//! - [`KeyStore`]: keys by (owner, key id) and the rotation state machine
//! - [`ManagementRecord`]: unencrypted management messages from the API
//! - [`HandlerConfig`]: protocol version and key wrapping policy
//! - [`ClientError`]: failures and their mapping onto message status

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod directory;
pub mod env;
pub mod error;
pub mod handler;
pub mod key_cache;
pub mod key_store;
mod keyring;
pub mod management;
mod title;

pub use config::{FORCE_RSA_ENV, HandlerConfig, RsaFallback};
pub use directory::{DirectoryError, PublicKeyDirectory, PublicKeyKind};
pub use env::{Environment, SystemEnv};
pub use error::{ClientError, Result};
pub use handler::{EncryptOutput, KeyDelivery, ProtocolHandler};
pub use key_cache::{CacheError, CachedKey, KeyCache};
pub use key_store::{
    Confirmed, CurrentKey, KeyResolution, KeyStore, PendingKey, RotationState,
};
pub use management::{ManagementPayload, ManagementRecord};
pub use title::EncryptedTitle;
