//! Versioned identifiers and match-rule resolution.
//!
//! Versions have four segments, `major.minor.service.qualifier`. The first
//! three are numeric, the qualifier is an arbitrary string compared
//! lexicographically. Missing numeric segments read as zero, so `"2.1"` is
//! `2.1.0`; anything non-numeric in the first three segments is rejected.
//!
//! # Examples
//!
//! ```
//! use update_model::version::{MatchRule, VersionedIdentifier, satisfies};
//!
//! let required = VersionedIdentifier::parse("org.example.core", "1.2.0").unwrap();
//! let candidate = VersionedIdentifier::parse("org.example.core", "1.4.2.v2024").unwrap();
//! assert!(satisfies(&candidate, &required, MatchRule::Compatible));
//! assert!(!satisfies(&candidate, &required, MatchRule::Equivalent));
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A four-segment version.
///
/// Field order drives the derived ordering: major, then minor, then
/// service, then the qualifier string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    major: u32,
    minor: u32,
    service: u32,
    qualifier: String,
}

impl Version {
    /// Create a version without a qualifier.
    pub fn new(major: u32, minor: u32, service: u32) -> Self {
        Self {
            major,
            minor,
            service,
            qualifier: String::new(),
        }
    }

    /// Attach a qualifier.
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    /// Parse `major[.minor[.service[.qualifier]]]`.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(Error::InvalidVersion {
                version: input.to_string(),
                reason: "empty version".to_string(),
            });
        }

        let mut segments = raw.splitn(4, '.');
        let mut numeric = [0u32; 3];
        for (idx, slot) in numeric.iter_mut().enumerate() {
            match segments.next() {
                Some(segment) => *slot = parse_segment(input, segment, idx)?,
                None => break,
            }
        }

        let qualifier = segments.next().unwrap_or_default();
        if qualifier.is_empty() && raw.matches('.').count() >= 3 {
            return Err(Error::InvalidVersion {
                version: input.to_string(),
                reason: "empty qualifier".to_string(),
            });
        }
        if qualifier.chars().any(char::is_whitespace) {
            return Err(Error::InvalidVersion {
                version: input.to_string(),
                reason: "qualifier must not contain whitespace".to_string(),
            });
        }

        Ok(Self {
            major: numeric[0],
            minor: numeric[1],
            service: numeric[2],
            qualifier: qualifier.to_string(),
        })
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn service(&self) -> u32 {
        self.service
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    /// Compare the numeric segments only, ignoring the qualifier.
    pub fn cmp_numeric(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.service).cmp(&(other.major, other.minor, other.service))
    }
}

fn parse_segment(input: &str, segment: &str, idx: usize) -> Result<u32> {
    let name = ["major", "minor", "service"][idx];
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidVersion {
            version: input.to_string(),
            reason: format!("{name} segment '{segment}' is not a non-negative integer"),
        });
    }
    segment.parse().map_err(|_| Error::InvalidVersion {
        version: input.to_string(),
        reason: format!("{name} segment '{segment}' is out of range"),
    })
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.service)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

/// Identity of a feature or plugin: id plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionedIdentifier {
    id: String,
    version: Version,
}

impl VersionedIdentifier {
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }

    /// Parse the version part and pair it with `id`.
    pub fn parse(id: impl Into<String>, version: &str) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidIdentifier {
                id,
                reason: "identifier must not be empty".to_string(),
            });
        }
        Ok(Self {
            id,
            version: Version::parse(version)?,
        })
    }

    /// Parse the `<id>_<version>` form used for install directory names.
    pub fn from_path_name(name: &str) -> Result<Self> {
        let (id, version) = name.rsplit_once('_').ok_or_else(|| Error::InvalidIdentifier {
            id: name.to_string(),
            reason: "expected <id>_<version>".to_string(),
        })?;
        Self::parse(id, version)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// The `<id>_<version>` form used for install directory names.
    pub fn path_name(&self) -> String {
        format!("{}_{}", self.id, self.version)
    }
}

impl fmt::Display for VersionedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.id, self.version)
    }
}

/// How a candidate version must relate to a required version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchRule {
    /// Exact equality, qualifier included.
    Perfect,
    /// Same major and minor.
    Equivalent,
    /// Same major, candidate minor at least the required minor.
    #[default]
    Compatible,
    /// Candidate not lower than required in the full ordering.
    GreaterOrEqual,
    /// Any version.
    None,
}

impl MatchRule {
    /// Map a manifest `match` attribute to a rule.
    ///
    /// An absent attribute means [`Compatible`](Self::Compatible). Unknown
    /// names, and `"none"`, fall back to [`Perfect`](Self::Perfect): an
    /// import in a manifest always pins something.
    pub fn from_manifest(rule: Option<&str>) -> Self {
        let Some(rule) = rule else {
            return Self::Compatible;
        };
        match rule.trim().to_ascii_lowercase().as_str() {
            "perfect" => Self::Perfect,
            "equivalent" => Self::Equivalent,
            "compatible" => Self::Compatible,
            "greaterorequal" | "greater-or-equal" | "greater_or_equal" => Self::GreaterOrEqual,
            _ => Self::Perfect,
        }
    }

    /// Name written back into manifests.
    pub fn manifest_name(&self) -> &'static str {
        match self {
            Self::Perfect => "perfect",
            Self::Equivalent => "equivalent",
            Self::Compatible => "compatible",
            Self::GreaterOrEqual => "greaterOrEqual",
            Self::None => "none",
        }
    }

    /// Check a candidate version against a required version.
    pub fn matches(&self, candidate: &Version, required: &Version) -> bool {
        match self {
            Self::Perfect => candidate == required,
            Self::Equivalent => {
                candidate.major == required.major && candidate.minor == required.minor
            }
            Self::Compatible => {
                candidate.major == required.major && candidate.minor >= required.minor
            }
            Self::GreaterOrEqual => candidate >= required,
            Self::None => true,
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.manifest_name())
    }
}

/// Whether `candidate` satisfies a requirement on `required` under `rule`.
///
/// Identifiers must be equal; the rule only governs versions.
pub fn satisfies(candidate: &VersionedIdentifier, required: &VersionedIdentifier, rule: MatchRule) -> bool {
    candidate.id == required.id && rule.matches(&candidate.version, &required.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn vid(id: &str, version: &str) -> VersionedIdentifier {
        VersionedIdentifier::parse(id, version).unwrap()
    }

    #[rstest]
    #[case("1", Version::new(1, 0, 0))]
    #[case("1.2", Version::new(1, 2, 0))]
    #[case("1.2.3", Version::new(1, 2, 3))]
    #[case("1.2.3.v20240101", Version::new(1, 2, 3).with_qualifier("v20240101"))]
    #[case(" 3.0.0 ", Version::new(3, 0, 0))]
    #[case("1.2.3.qual.with.dots", Version::new(1, 2, 3).with_qualifier("qual.with.dots"))]
    fn parse_accepts(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(Version::parse(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("a.b.c")]
    #[case("1.-2.0")]
    #[case("1..0")]
    #[case("1.2.x")]
    #[case("1.2.3.")]
    #[case("99999999999.0.0")]
    fn parse_rejects(#[case] input: &str) {
        assert!(matches!(
            Version::parse(input),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn ordering_is_lexicographic_over_segments() {
        assert!(v("1.0.0") < v("1.0.1"));
        assert!(v("1.9.9") < v("2.0.0"));
        assert!(v("1.0.0") < v("1.0.0.a"));
        assert!(v("1.0.0.a") < v("1.0.0.b"));
        assert!(v("1.0.0.z") < v("1.0.1"));
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(v("1.2").to_string(), "1.2.0");
        assert_eq!(v("1.2.3.rc1").to_string(), "1.2.3.rc1");
        assert_eq!(vid("org.a", "1.0").to_string(), "org.a_1.0.0");
    }

    #[test]
    fn path_name_parses_back() {
        let id = vid("org.example.core", "2.1.0.v1");
        let parsed = VersionedIdentifier::from_path_name(&id.path_name()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn perfect_requires_exact_match() {
        assert!(satisfies(&vid("a", "1.0.0"), &vid("a", "1.0.0"), MatchRule::Perfect));
        assert!(!satisfies(&vid("a", "1.0.0.q"), &vid("a", "1.0.0"), MatchRule::Perfect));
        assert!(!satisfies(&vid("b", "1.0.0"), &vid("a", "1.0.0"), MatchRule::Perfect));
    }

    #[test]
    fn equivalent_and_compatible_ignore_qualifier_and_service() {
        let required = vid("a", "1.2.0.x");
        assert!(satisfies(&vid("a", "1.2.9"), &required, MatchRule::Equivalent));
        assert!(!satisfies(&vid("a", "1.3.0"), &required, MatchRule::Equivalent));
        assert!(satisfies(&vid("a", "1.3.0"), &required, MatchRule::Compatible));
        assert!(!satisfies(&vid("a", "1.1.0"), &required, MatchRule::Compatible));
        assert!(!satisfies(&vid("a", "2.2.0"), &required, MatchRule::Compatible));
    }

    #[test]
    fn greater_or_equal_uses_full_ordering() {
        let required = vid("a", "1.2.0.b");
        assert!(satisfies(&vid("a", "1.2.0.b"), &required, MatchRule::GreaterOrEqual));
        assert!(satisfies(&vid("a", "1.2.0.c"), &required, MatchRule::GreaterOrEqual));
        assert!(!satisfies(&vid("a", "1.2.0.a"), &required, MatchRule::GreaterOrEqual));
    }

    #[test]
    fn none_accepts_any_version() {
        assert!(satisfies(&vid("a", "0.0.1"), &vid("a", "9.0.0"), MatchRule::None));
    }

    #[rstest]
    #[case(None, MatchRule::Compatible)]
    #[case(Some("perfect"), MatchRule::Perfect)]
    #[case(Some("Equivalent"), MatchRule::Equivalent)]
    #[case(Some("greaterOrEqual"), MatchRule::GreaterOrEqual)]
    #[case(Some("none"), MatchRule::Perfect)]
    #[case(Some("bogus"), MatchRule::Perfect)]
    fn manifest_rule_mapping(#[case] raw: Option<&str>, #[case] expected: MatchRule) {
        assert_eq!(MatchRule::from_manifest(raw), expected);
    }

    #[test]
    fn version_serializes_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            version: Version,
        }
        let text = toml::to_string(&Holder { version: v("1.2.3.q") }).unwrap();
        assert!(text.contains("version = \"1.2.3.q\""));
        let back: Holder = toml::from_str(&text).unwrap();
        assert_eq!(back.version, v("1.2.3.q"));
    }
}
