//! Identifier newtypes shared by commands, envelopes and messages.

use std::fmt;

macro_rules! id64 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// Big-endian wire bytes
            pub const fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            /// Parse from big-endian wire bytes
            pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
                Self(u64::from_be_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:016x}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id64!(
    /// User handle
    UserId
);
id64!(
    /// Chat room handle
    ChatId
);
id64!(
    /// Message id, either server-assigned or a client transaction id
    MessageId
);

impl UserId {
    /// Reserved sender of server-generated management messages.
    ///
    /// Messages from this sender with key id zero are unencrypted.
    pub const API: Self = Self(0xB4FC_9D53_8645_3C81);

    /// Whether this is the reserved API sender
    pub const fn is_api(self) -> bool {
        self.0 == Self::API.0
    }
}

/// Identifier of a send key within (chat, owner).
///
/// Key ids are 32 bits on the wire from version 2 onward. The top of the
/// range (`0xFFFF_0000..`) is reserved for client-local ids that the server
/// has not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KeyId(pub u32);

impl KeyId {
    /// No key. Also marks unencrypted management messages.
    pub const INVALID: Self = Self(0);

    /// Sentinel for a locally generated key awaiting server confirmation
    pub const UNCONFIRMED: Self = Self(0xFFFF_FFFE);

    /// Lowest id of the client-local range
    pub const LOCAL_MIN: Self = Self(0xFFFF_0000);

    /// Whether the id is in the client-local range
    pub const fn is_local(self) -> bool {
        self.0 >= Self::LOCAL_MIN.0
    }

    /// Whether the id is the unconfirmed sentinel
    pub const fn is_unconfirmed(self) -> bool {
        self.0 == Self::UNCONFIRMED.0
    }

    /// Whether the id can identify a server-confirmed key
    pub const fn is_confirmed(self) -> bool {
        self.0 != Self::INVALID.0 && !self.is_local()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unconfirmed() { f.write_str("unconfirmed") } else { write!(f, "{:#x}", self.0) }
    }
}

impl From<u32> for KeyId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl TryFrom<u64> for KeyId {
    type Error = crate::ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u32::try_from(value).map(Self).map_err(|_| crate::ProtocolError::KeyIdOverflow(value))
    }
}
