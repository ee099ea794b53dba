//! Agent version (SPEC_FULL.md C.7): a semantic-version tuple for the User-Agent header
//! (spec.md section 6) and the obsolete/old comparison against the cloud handshake
//! response (spec.md section 4.8).

use std::cmp::Ordering;
use std::fmt;

pub const AGENT_NAME: &str = "agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Version { major, minor, patch }
    }

    /// The version this binary was built as.
    pub const fn current() -> Self {
        Version::new(2, 0, 0)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().unwrap_or("0").parse().ok()?;
        Some(Version::new(major, minor, patch))
    }

    pub fn user_agent(&self) -> String {
        format!("nginx-{}-agent/{}", AGENT_NAME, self)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The versions the cloud handshake reports (spec.md section 6:
/// `versions:{current,obsolete,old}`).
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    pub current: Version,
    pub obsolete: Version,
    pub old: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    Current,
    /// Behind `old` but still accepted.
    Old,
    /// At or below `obsolete`; spec.md section 4.8 requires the Supervisor to stop.
    Obsolete,
}

impl VersionPolicy {
    pub fn status(&self, running: Version) -> VersionStatus {
        match running.cmp(&self.obsolete) {
            Ordering::Less | Ordering::Equal => VersionStatus::Obsolete,
            Ordering::Greater => {
                if running < self.old {
                    VersionStatus::Old
                } else {
                    VersionStatus::Current
                }
            }
        }
    }
}
