use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A `major.minor.patch` release version.
///
/// Missing components default to 0, so `2` and `2.0.0` compare equal. A
/// leading `v`/`V` is accepted and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let normalized = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if normalized.is_empty() {
            return Err(anyhow!("version value is empty"));
        }
        if normalized.starts_with('.') || normalized.ends_with('.') {
            return Err(anyhow!(
                "version '{}' must be dot-separated numeric segments",
                raw
            ));
        }

        let mut values = [0u64; 3];
        for (idx, segment) in normalized.split('.').enumerate() {
            if idx >= values.len() {
                return Err(anyhow!(
                    "version '{}' has more than three segments",
                    raw
                ));
            }
            if segment.is_empty() || !segment.chars().all(|ch| ch.is_ascii_digit()) {
                return Err(anyhow!(
                    "version '{}' must be dot-separated numeric segments",
                    raw
                ));
            }
            values[idx] = segment
                .parse::<u64>()
                .map_err(|_| anyhow!("version '{}' contains unsupported numeric segment", raw))?;
        }

        Ok(Self::new(values[0], values[1], values[2]))
    }

    /// Parses when possible, `None` otherwise. Used where an unreadable
    /// version means "skip this one" rather than an error.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        Self::parse(raw).ok()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
