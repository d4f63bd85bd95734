//! Process-unique identity of a transport instance.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of a [`LocalIdentity`] in bytes.
pub const IDENTITY_LEN: usize = 16;

/// Opaque 16-byte token identifying one transport instance.
///
/// Generated once when a transport is constructed and never changed. It is
/// written into every outbound frame header and compared against inbound
/// headers to suppress self-originated broadcasts. The broker transport uses
/// its hex form as the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalIdentity {
    bytes: [u8; IDENTITY_LEN],
}

impl LocalIdentity {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            bytes: *Uuid::new_v4().as_bytes(),
        }
    }

    /// Creates an identity from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self { bytes }
    }

    /// Reads an identity from the first [`IDENTITY_LEN`] bytes of `buf`.
    ///
    /// Returns `None` if `buf` is shorter than an identity.
    #[must_use]
    pub fn from_prefix(buf: &[u8]) -> Option<Self> {
        let prefix = buf.get(..IDENTITY_LEN)?;
        let mut bytes = [0u8; IDENTITY_LEN];
        bytes.copy_from_slice(prefix);
        Some(Self { bytes })
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.bytes
    }

    /// Returns true if `buf` starts with this identity.
    #[must_use]
    pub fn is_prefix_of(&self, buf: &[u8]) -> bool {
        buf.get(..IDENTITY_LEN) == Some(&self.bytes[..])
    }

    /// Upper-case hex form, used as the broker routing key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.bytes)
    }
}

impl fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; IDENTITY_LEN]> for LocalIdentity {
    fn from(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}
