//! Dotted-integer migration versions

use crate::migration::GuardError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A migration version such as `1`, `1.0` or `2.10.3`.
///
/// Versions compare numerically segment by segment; trailing zero segments are ignored, so
/// `1.0 == 1` and `1.2 < 1.10`. Underscores are accepted as separators, matching script file
/// names like `V1_2__add_index.sql`. The original spelling is kept for display.
#[derive(Debug, Clone)]
pub struct MigrationVersion {
    segments: Vec<u64>,
    raw: String,
}

impl MigrationVersion {
    pub fn parse(raw: &str) -> Result<Self, GuardError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GuardError::InvalidVersion(raw.to_string()));
        }

        let segments = trimmed
            .split(['.', '_'])
            .map(|segment| segment.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| GuardError::InvalidVersion(raw.to_string()))?;

        Ok(Self {
            segments,
            raw: trimmed.replace('_', "."),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Segments with trailing zeros removed; the basis of equality and ordering.
    fn significant(&self) -> &[u64] {
        let len = self
            .segments
            .iter()
            .rposition(|s| *s != 0)
            .map_or(0, |i| i + 1);
        &self.segments[..len]
    }
}

impl PartialEq for MigrationVersion {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for MigrationVersion {}

impl Hash for MigrationVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.significant().cmp(other.significant())
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for MigrationVersion {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MigrationVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for MigrationVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    #[test]
    fn orders_numerically_not_lexically() {
        assert!(v("1.2") < v("1.10"));
        assert!(v("2") > v("1.99"));
        assert!(v("1.0.1") > v("1"));
    }

    #[test]
    fn trailing_zeros_are_insignificant() {
        assert_eq!(v("1.0"), v("1"));
        assert_eq!(v("1.0").to_string(), "1.0");
        assert_eq!(v("0"), v("0.0"));
    }

    #[test]
    fn underscores_normalise_to_dots() {
        assert_eq!(v("1_2"), v("1.2"));
        assert_eq!(v("1_2").as_str(), "1.2");
    }

    #[test]
    fn rejects_garbage() {
        assert!(MigrationVersion::parse("").is_err());
        assert!(MigrationVersion::parse("1.a").is_err());
        assert!(MigrationVersion::parse("1..2").is_err());
    }
}
