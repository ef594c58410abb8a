//! Lenient semantic-version parsing for discovery probes and runtime gates.
//!
//! Runtime version strings vary widely (`v20.11.0`, `openjdk version
//! "17.0.9"`, `1.14.0`), so parsing extracts the first dotted numeric
//! sequence and ignores everything around it.

use std::cmp::Ordering;
use std::fmt;

/// A parsed three-component version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Construct a version from components.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the first dotted numeric sequence out of an arbitrary string.
    ///
    /// Returns `None` when the string contains no digits. Missing minor or
    /// patch components default to zero, so `"11"` parses as `11.0.0`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let start = s.find(|c: char| c.is_ascii_digit())?;
        let tail = &s[start..];
        let end = tail
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(tail.len());
        let mut parts = tail[..end].split('.');

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Compare against a minimum version requirement.
    #[must_use]
    pub fn satisfies(&self, minimum: &Version) -> bool {
        self.cmp(minimum) != Ordering::Less
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
