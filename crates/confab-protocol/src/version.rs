//! Protocol versioning for Confab.
//!
//! Clients may announce the major version they speak in the `Authenticate`
//! action; the gateway rejects incompatible majors before resolving
//! identity and echoes its own version back in `Authenticated`.

use serde::{Deserialize, Serialize};

/// The version this build of the protocol speaks.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// A protocol version.
///
/// Majors break the wire format; minors only add event variants, which old
/// readers skip, so compatibility is decided on the major alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Create a version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The version a client implies when it announces only a major.
    #[must_use]
    pub const fn from_major(major: u8) -> Self {
        Self::new(major, 0)
    }

    /// Whether two versions can talk to each other.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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
    fn test_minor_bumps_stay_compatible() {
        assert!(Version::new(1, 3).is_compatible_with(&PROTOCOL_VERSION));
        assert!(Version::from_major(1).is_compatible_with(&Version::new(1, 9)));
    }

    #[test]
    fn test_major_bumps_break_compatibility() {
        assert!(!Version::from_major(2).is_compatible_with(&PROTOCOL_VERSION));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
