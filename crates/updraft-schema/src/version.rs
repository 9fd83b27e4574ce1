//! Release versions.
//!
//! Asset names may or may not carry a version. When they do not, the
//! classifier yields [`ReleaseVersion::Undetermined`] and the registry fills
//! the gap from the release tag.

use std::cmp::Ordering;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A semantic version, or the sentinel for "not present in the asset name".
///
/// Ordering is total: `Undetermined` sorts below every known version, and
/// known versions follow semver precedence (so `1.2.0-rc.1 < 1.2.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReleaseVersion {
    /// The asset name carried no version.
    #[default]
    Undetermined,
    /// A parsed semantic version.
    Known(semver::Version),
}

impl ReleaseVersion {
    /// Parse `1.2.3`, `v1.2.3` or `1.2.3-beta.1`.
    ///
    /// # Errors
    ///
    /// Returns [`semver::Error`] if the string (minus a leading `v`) is not a
    /// valid semantic version.
    pub fn parse(s: &str) -> Result<Self, semver::Error> {
        let trimmed = s.strip_prefix('v').unwrap_or(s);
        Ok(Self::Known(semver::Version::parse(trimmed)?))
    }

    /// Build a release version from its numeric triple.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self::Known(semver::Version::new(major, minor, patch))
    }

    /// True for the sentinel value.
    pub fn is_undetermined(&self) -> bool {
        matches!(self, Self::Undetermined)
    }

    /// The underlying semver value, if known.
    pub fn as_semver(&self) -> Option<&semver::Version> {
        match self {
            Self::Known(v) => Some(v),
            Self::Undetermined => None,
        }
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Undetermined, Self::Undetermined) => Ordering::Equal,
            (Self::Undetermined, Self::Known(_)) => Ordering::Less,
            (Self::Known(_), Self::Undetermined) => Ordering::Greater,
            (Self::Known(a), Self::Known(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Field-wise comparison of two versions.
///
/// `Less` means `a` is lower than `b` (an update from `a` to `b` exists),
/// `Greater` means `a` is ahead.
pub fn compare(a: &ReleaseVersion, b: &ReleaseVersion) -> Ordering {
    a.cmp(b)
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undetermined => write!(f, "undetermined"),
            Self::Known(v) => write!(f, "{v}"),
        }
    }
}

impl std::str::FromStr for ReleaseVersion {
    type Err = semver::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<semver::Version> for ReleaseVersion {
    fn from(v: semver::Version) -> Self {
        Self::Known(v)
    }
}

impl Serialize for ReleaseVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReleaseVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "undetermined" {
            return Ok(Self::Undetermined);
        }
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ReleaseVersion {
        ReleaseVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse_accepts_leading_v() {
        assert_eq!(v("v1.2.3"), ReleaseVersion::new(1, 2, 3));
        assert!(ReleaseVersion::parse("1.2").is_err());
        assert!(ReleaseVersion::parse("latest").is_err());
    }

    #[test]
    fn test_compare_numeric_fields() {
        assert_eq!(compare(&v("1.2.3"), &v("1.2.4")), Ordering::Less);
        assert_eq!(compare(&v("1.2.3"), &v("1.3.0")), Ordering::Less);
        assert_eq!(compare(&v("1.2.3"), &v("2.0.0")), Ordering::Less);
        assert_eq!(compare(&v("0.10.4"), &v("0.11.5")), Ordering::Less);
        assert_eq!(compare(&v("1.11.5"), &v("1.10.4")), Ordering::Greater);
        assert_eq!(compare(&v("1.2.3"), &v("1.2.3")), Ordering::Equal);
    }

    #[test]
    fn test_release_outranks_prerelease() {
        assert_eq!(compare(&v("1.2.0-rc.1"), &v("1.2.0")), Ordering::Less);
        assert_eq!(compare(&v("1.2.0-alpha"), &v("1.2.0-beta")), Ordering::Less);
        assert_eq!(compare(&v("1.2.0-rc.1"), &v("1.1.9")), Ordering::Greater);
    }

    #[test]
    fn test_undetermined_sorts_first() {
        assert_eq!(
            compare(&ReleaseVersion::Undetermined, &v("0.0.1")),
            Ordering::Less
        );
        assert_eq!(
            compare(&ReleaseVersion::Undetermined, &ReleaseVersion::Undetermined),
            Ordering::Equal
        );
    }

    #[test]
    fn test_compare_is_antisymmetric_total_order() {
        let versions = [
            ReleaseVersion::Undetermined,
            v("0.9.0"),
            v("1.0.0-alpha"),
            v("1.0.0-alpha.1"),
            v("1.0.0-beta"),
            v("1.0.0"),
            v("1.0.1"),
            v("1.10.0"),
            v("2.0.0"),
        ];
        for (i, a) in versions.iter().enumerate() {
            assert_eq!(compare(a, a), Ordering::Equal);
            for (j, b) in versions.iter().enumerate() {
                assert_eq!(compare(a, b), compare(b, a).reverse());
                assert_eq!(compare(a, b), i.cmp(&j), "{a} vs {b}");
            }
        }
    }
}
