//! Protocol versioning for Huddle.
//!
//! Payload shapes only change together with a major version bump. Peers may
//! request a major version during the handshake; anything else is refused.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// The peer asked for a protocol this gateway does not speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unsupported protocol version {requested} (server speaks {supported})")]
pub struct VersionMismatch {
    pub requested: u8,
    pub supported: Version,
}

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Breaking payload changes increment this.
    pub major: u8,
    /// Additive changes increment this.
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Negotiate against a requested major version.
    ///
    /// A peer that does not ask for a version gets the current one.
    ///
    /// # Errors
    ///
    /// Returns [`VersionMismatch`] if the requested major differs.
    pub fn negotiate(self, requested: Option<u8>) -> Result<Version, VersionMismatch> {
        match requested {
            None => Ok(self),
            Some(major) if major == self.major => Ok(self),
            Some(major) => Err(VersionMismatch {
                requested: major,
                supported: self,
            }),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        let v = Version::new(1, 3);
        assert_eq!(v.negotiate(None), Ok(v));
        assert_eq!(v.negotiate(Some(1)), Ok(v));

        let err = v.negotiate(Some(2)).unwrap_err();
        assert_eq!(err.requested, 2);
        assert_eq!(err.to_string(), "Unsupported protocol version 2 (server speaks 1.3)");
    }
}
