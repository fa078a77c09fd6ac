//! Protocol versioning.
//!
//! Clients announce the major version they speak in their `Connect` frame;
//! the server accepts any client whose major version it supports.

use std::fmt;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Oldest major version the server still accepts.
pub const MIN_SUPPORTED_MAJOR: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Pick the major version to speak with a client announcing `client_major`.
    ///
    /// Returns `None` when the client is outside the supported range.
    #[must_use]
    pub fn negotiate(&self, client_major: u8) -> Option<u8> {
        (MIN_SUPPORTED_MAJOR..=self.major)
            .contains(&client_major)
            .then_some(client_major)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
