//! Wire protocol versioning
//!
//! Every envelope carries the sender's version; receivers drop envelopes
//! from an incompatible major version instead of misinterpreting them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current wire protocol version
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Peers interoperate as long as the major version matches; minor
    /// versions only add optional fields.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Reject envelopes written by an incompatible peer
    pub fn check_remote(&self, remote: &ProtocolVersion) -> Result<()> {
        if self.is_compatible_with(remote) {
            Ok(())
        } else {
            Err(Error::ProtocolVersion {
                expected: self.to_string(),
                actual: remote.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_bumps_interoperate() {
        let local = ProtocolVersion::new(1, 0, 0);
        assert!(local.check_remote(&ProtocolVersion::new(1, 3, 2)).is_ok());
    }

    #[test]
    fn test_major_mismatch_is_rejected() {
        let local = ProtocolVersion::new(1, 0, 0);
        let err = local.check_remote(&ProtocolVersion::new(2, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("expected 1.0.0, got 2.0.0"));
    }
}
