//! Protocol handler configuration.

use strongvelope_proto::ProtocolVersion;

/// Environment variable that forces RSA key wrapping
pub const FORCE_RSA_ENV: &str = "STRONGVELOPE_FORCE_RSA";

/// When wrapping falls back from the pairwise scheme to RSA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RsaFallback {
    /// Only when the directory reports that the recipient has no Curve25519
    /// key. Network errors stay wrap failures.
    #[default]
    MissingCurveKey,
    /// On any failure of the pairwise path
    AnyError,
}

/// Protocol handler configuration.
///
/// # Examples
///
/// ```
/// use strongvelope_client::{HandlerConfig, RsaFallback};
/// use strongvelope_proto::ProtocolVersion;
///
/// let config = HandlerConfig::default()
///     .with_protocol_version(ProtocolVersion::V2)
///     .with_rsa_fallback(RsaFallback::AnyError);
/// assert!(!config.force_rsa);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Version of emitted envelopes. All supported versions are decoded.
    pub protocol_version: ProtocolVersion,
    /// Wrap every key with RSA, even for recipients with a Curve25519 key
    pub force_rsa: bool,
    /// Fallback policy from pairwise to RSA wrapping
    pub rsa_fallback: RsaFallback,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            force_rsa: false,
            rsa_fallback: RsaFallback::default(),
        }
    }
}

impl HandlerConfig {
    /// Defaults, with `force_rsa` taken from `STRONGVELOPE_FORCE_RSA`
    pub fn from_env() -> Self {
        let force_rsa = std::env::var(FORCE_RSA_ENV)
            .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);
        if force_rsa {
            tracing::warn!("{FORCE_RSA_ENV} set, all keys will be wrapped with RSA");
        }
        Self { force_rsa, ..Self::default() }
    }

    /// Set the emitted protocol version
    #[must_use]
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Force RSA wrapping
    #[must_use]
    pub fn with_force_rsa(mut self, force_rsa: bool) -> Self {
        self.force_rsa = force_rsa;
        self
    }

    /// Set the RSA fallback policy
    #[must_use]
    pub fn with_rsa_fallback(mut self, policy: RsaFallback) -> Self {
        self.rsa_fallback = policy;
        self
    }
}
