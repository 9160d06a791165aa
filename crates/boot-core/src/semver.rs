//! Semantic version parsing, ordering, and range algebra.
//!
//! Supports the requirement grammar found in crate manifests:
//!
//! - Exact and comparator requirements: `=1.2.3`, `>=0.6.1`, `<0.8`
//! - Caret requirements: `^1.2`, or a bare `1.2` (caret is implied)
//! - Tilde requirements: `~1.2.3`
//! - Wildcards: `*`, `1.*`, `1.2.*`
//! - Comma conjunctions: `>=0.6.1, <0.8`
//!
//! Caret, tilde, and wildcard forms expand to a half-open `[lower, upper)`
//! interval; comparator forms are evaluated directly against the reference
//! version. Missing minor/patch components normalize to zero for comparison
//! while the parsed form is retained for display.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<major>0|[1-9][0-9]*)(\.(?P<minor>0|[1-9][0-9]*))?(\.(?P<patch>0|[1-9][0-9]*))?(-(?P<pre>[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*))?(\+(?P<build>[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*))?\s*$",
    )
    .expect("version regex is valid")
});

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<op><=|>=|=|<|>|\^|~)?\s*(?P<major>\*|0|[1-9][0-9]*)(\.(?P<minor>\*|0|[1-9][0-9]*))?(\.(?P<patch>\*|0|[1-9][0-9]*))?(-(?P<pre>[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*))?(\+(?P<build>[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*))?$",
    )
    .expect("range regex is valid")
});

/// Errors produced while parsing versions and version requirements.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The string does not match the `M[.m[.p]][-pre][+build]` grammar.
    #[error("`{0}` is not a valid semver string")]
    InvalidVersion(String),

    /// The string does not match the requirement grammar.
    #[error("`{0}` is not a valid semver range")]
    InvalidRange(String),
}

/// An ordered list of dot-separated prerelease identifiers.
///
/// A version without a prerelease has higher precedence than any version
/// with one. Between two prereleases, identifiers compare element-wise:
/// numeric identifiers compare numerically and sort below alphanumeric
/// ones, alphanumeric identifiers compare lexically, and a list that is a
/// strict prefix of another sorts below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Prerelease(Vec<String>);

impl Prerelease {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some(s) => Self(s.split('.').map(str::to_string).collect()),
            None => Self(Vec::new()),
        }
    }

    /// True when the version carries no prerelease identifiers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Prerelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Compare two prerelease identifiers. Numeric identifiers compare
/// numerically and sort below alphanumeric ones.
fn ident_cmp(a: &str, b: &str) -> Ordering {
    let a_num = !a.is_empty() && a.bytes().all(|b| b.is_ascii_digit());
    let b_num = !b.is_empty() && b.bytes().all(|b| b.is_ascii_digit());
    match (a_num, b_num) {
        // numbers of equal digit-length compare lexically, shorter is smaller
        (true, true) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

impl Ord for Prerelease {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.is_empty(), other.0.is_empty()) {
            (true, true) => return Ordering::Equal,
            // no prerelease sorts above any prerelease
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }
        for (l, r) in self.0.iter().zip(other.0.iter()) {
            match ident_cmp(l, r) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for Prerelease {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed semantic version.
///
/// Missing minor/patch components are remembered as absent but normalize to
/// zero everywhere it matters: `1` displays as `1.0.0` and compares equal to
/// `1.0.0`.
#[derive(Debug, Clone)]
pub struct Version {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
    build: Option<String>,
}

impl Version {
    /// Major component.
    pub fn major(&self) -> u64 {
        self.major
    }

    /// Minor component, normalized to 0 when absent.
    pub fn minor(&self) -> u64 {
        self.minor.unwrap_or(0)
    }

    /// Patch component, normalized to 0 when absent.
    pub fn patch(&self) -> u64 {
        self.patch.unwrap_or(0)
    }

    /// Prerelease identifiers.
    pub fn pre(&self) -> &Prerelease {
        &self.pre
    }

    /// Opaque build metadata, if any.
    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    fn from_parts(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor: Some(minor),
            patch: Some(patch),
            pre: Prerelease::default(),
            build: None,
        }
    }

    fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor(), self.patch())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = VERSION_RE
            .captures(s)
            .ok_or_else(|| VersionError::InvalidVersion(s.to_string()))?;
        let num = |name: &str| caps.name(name).map(|m| m.as_str().parse::<u64>());
        let major = match num("major") {
            Some(Ok(n)) => n,
            _ => return Err(VersionError::InvalidVersion(s.to_string())),
        };
        let minor = num("minor")
            .transpose()
            .map_err(|_| VersionError::InvalidVersion(s.to_string()))?;
        let patch = num("patch")
            .transpose()
            .map_err(|_| VersionError::InvalidVersion(s.to_string()))?;
        Ok(Self {
            major,
            minor,
            patch,
            pre: Prerelease::parse(caps.name("pre").map(|m| m.as_str())),
            build: caps.name("build").map(|m| m.as_str().to_string()),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor(), self.patch())?;
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple() && self.pre == other.pre && self.build == other.build
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
        self.pre.hash(state);
        self.build.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple()
            .cmp(&other.triple())
            .then_with(|| self.pre.cmp(&other.pre))
            // build metadata carries no precedence; compared last only to
            // keep the ordering total and consistent with equality
            .then_with(|| self.build.cmp(&other.build))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Comparator operators for single-point requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `=`
    Eq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

#[derive(Debug, Clone)]
enum RangeKind {
    /// A single-operator predicate against a reference version.
    Comparator { op: CompOp, version: Version },
    /// A half-open `[lower, upper)` interval; `upper == None` is unbounded.
    Interval {
        lower: Version,
        upper: Option<Version>,
    },
}

/// A parsed version requirement.
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    kind: RangeKind,
}

impl VersionRange {
    /// Matches every version. Used for local path dependencies, which are
    /// pinned by location rather than by version.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            kind: RangeKind::Interval {
                lower: Version::from_parts(0, 0, 0),
                upper: None,
            },
        }
    }

    /// The `[lower, upper)` interval of a caret/tilde/wildcard requirement,
    /// or `None` for comparator requirements.
    pub fn bounds(&self) -> Option<(&Version, Option<&Version>)> {
        match &self.kind {
            RangeKind::Interval { lower, upper } => Some((lower, upper.as_ref())),
            RangeKind::Comparator { .. } => None,
        }
    }

    /// Whether `version` satisfies this requirement.
    pub fn satisfies(&self, version: &Version) -> bool {
        match &self.kind {
            RangeKind::Interval { lower, upper } => {
                version >= lower && upper.as_ref().is_none_or(|u| version < u)
            }
            RangeKind::Comparator { op, version: refv } => match op {
                CompOp::Lt => version < refv,
                CompOp::Le => version <= refv,
                CompOp::Eq => version == refv,
                CompOp::Gt => version > refv,
                CompOp::Ge => version >= refv,
            },
        }
    }

    fn parse_single(s: &str) -> Result<RangeKind, VersionError> {
        let caps = RANGE_RE
            .captures(s.trim())
            .ok_or_else(|| VersionError::InvalidRange(s.to_string()))?;

        let op = caps.name("op").map(|m| m.as_str());
        let major = caps.name("major").map(|m| m.as_str());
        let minor = caps.name("minor").map(|m| m.as_str());
        let patch = caps.name("patch").map(|m| m.as_str());
        let wildcard = [major, minor, patch]
            .iter()
            .any(|c| *c == Some("*"));

        if let Some(op) = op {
            // comparator and caret/tilde forms take a concrete version
            if wildcard {
                return Err(VersionError::InvalidRange(s.to_string()));
            }
            let version: Version = s.trim()[op.len()..].trim().parse()?;
            let kind = match op {
                "<" => RangeKind::Comparator { op: CompOp::Lt, version },
                "<=" => RangeKind::Comparator { op: CompOp::Le, version },
                "=" => RangeKind::Comparator { op: CompOp::Eq, version },
                ">" => RangeKind::Comparator { op: CompOp::Gt, version },
                ">=" => RangeKind::Comparator { op: CompOp::Ge, version },
                "^" => Self::caret(&version, minor.is_some(), patch.is_some()),
                "~" => Self::tilde(&version, minor.is_some()),
                _ => return Err(VersionError::InvalidRange(s.to_string())),
            };
            return Ok(kind);
        }

        if wildcard {
            return Ok(Self::wildcard(major, minor, patch, s)?);
        }

        // a bare version is an implicit caret
        let version: Version = s.trim().parse()?;
        Ok(Self::caret(&version, minor.is_some(), patch.is_some()))
    }

    fn caret(v: &Version, has_minor: bool, has_patch: bool) -> RangeKind {
        let (major, minor, patch) = (v.major(), v.minor(), v.patch());
        let lower = Version::from_parts(major, minor, patch);
        let upper = if !has_minor {
            Version::from_parts(major + 1, 0, 0)
        } else if !has_patch {
            if major > 0 {
                Version::from_parts(major + 1, 0, 0)
            } else {
                Version::from_parts(major, minor + 1, 0)
            }
        } else if major > 0 {
            Version::from_parts(major + 1, 0, 0)
        } else if minor > 0 {
            Version::from_parts(major, minor + 1, 0)
        } else {
            Version::from_parts(major, minor, patch + 1)
        };
        RangeKind::Interval {
            lower,
            upper: Some(upper),
        }
    }

    fn tilde(v: &Version, has_minor: bool) -> RangeKind {
        let (major, minor, patch) = (v.major(), v.minor(), v.patch());
        let lower = Version::from_parts(major, minor, patch);
        let upper = if has_minor {
            Version::from_parts(major, minor + 1, 0)
        } else {
            Version::from_parts(major + 1, 0, 0)
        };
        RangeKind::Interval {
            lower,
            upper: Some(upper),
        }
    }

    fn wildcard(
        major: Option<&str>,
        minor: Option<&str>,
        patch: Option<&str>,
        raw: &str,
    ) -> Result<RangeKind, VersionError> {
        let parse = |c: Option<&str>| -> Result<u64, VersionError> {
            c.unwrap_or("0")
                .parse()
                .map_err(|_| VersionError::InvalidRange(raw.to_string()))
        };
        if major == Some("*") {
            return Ok(RangeKind::Interval {
                lower: Version::from_parts(0, 0, 0),
                upper: None,
            });
        }
        let major = parse(major)?;
        if minor == Some("*") {
            return Ok(RangeKind::Interval {
                lower: Version::from_parts(major, 0, 0),
                upper: Some(Version::from_parts(major + 1, 0, 0)),
            });
        }
        let minor = parse(minor)?;
        if patch == Some("*") {
            return Ok(RangeKind::Interval {
                lower: Version::from_parts(major, minor, 0),
                upper: Some(Version::from_parts(major, minor + 1, 0)),
            });
        }
        Err(VersionError::InvalidRange(raw.to_string()))
    }

    /// Parse a comma conjunction by intersecting the bounds of its clauses:
    /// lower bounds tighten upward, upper bounds tighten downward. Among the
    /// comparators, `>=` contributes a lower bound and `<` an upper bound.
    fn parse_conjunction(s: &str) -> Result<RangeKind, VersionError> {
        let mut lower: Option<Version> = None;
        let mut upper: Option<Version> = None;
        let mut raise_lower = |v: Version| {
            if lower.as_ref().is_none_or(|l| v > *l) {
                lower = Some(v);
            }
        };
        let mut drop_upper = |v: Version| {
            if upper.as_ref().is_none_or(|u| v < *u) {
                upper = Some(v);
            }
        };
        for clause in s.split(',') {
            match Self::parse_single(clause.trim())? {
                RangeKind::Interval { lower: l, upper: u } => {
                    raise_lower(l);
                    if let Some(u) = u {
                        drop_upper(u);
                    }
                }
                RangeKind::Comparator { op: CompOp::Ge, version } => raise_lower(version),
                RangeKind::Comparator { op: CompOp::Lt, version } => drop_upper(version),
                RangeKind::Comparator { .. } => {}
            }
        }
        Ok(RangeKind::Interval {
            lower: lower.unwrap_or_else(|| Version::from_parts(0, 0, 0)),
            upper,
        })
    }
}

impl FromStr for VersionRange {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = if s.contains(',') {
            VersionRange::parse_conjunction(s)?
        } else {
            VersionRange::parse_single(s)?
        };
        Ok(Self {
            raw: s.trim().to_string(),
            kind,
        })
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
