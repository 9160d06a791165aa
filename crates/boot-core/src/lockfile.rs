//! Lockfile loading.
//!
//! The lockfile (`Cargo.lock`) pins exact versions for every transitive
//! dependency and is authoritative during a bootstrap build: the resolver
//! never selects a version the lockfile does not record. Each record's
//! `dependencies` entries are free-form `"name version (source)"` strings
//! and are parsed up front.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

static DEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+(\S+)(?:\s+\((.+)\))?$").expect("lock dependency regex is valid")
});

/// Errors produced while loading a lockfile.
#[derive(Error, Debug)]
pub enum LockfileError {
    /// The lockfile could not be read.
    #[error("failed to read lockfile: {0}")]
    Io(#[from] std::io::Error),

    /// The lockfile is not valid TOML.
    #[error("failed to parse lockfile: {0}")]
    Parse(#[from] toml::de::Error),

    /// The lockfile has no `[root]` table.
    #[error("lockfile has no [root] entry")]
    MissingRoot,

    /// A record's dependency string did not match `name version (source)`.
    #[error("malformed lock dependency `{entry}` in record for {name}")]
    MalformedDependency {
        /// Record the entry belongs to.
        name: String,
        /// The offending dependency string.
        entry: String,
    },
}

/// A parsed `"name version (source)"` dependency reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedDep {
    /// Dependency name.
    pub name: String,
    /// Pinned version string.
    pub version: String,
    /// Registry source, when recorded.
    pub source: Option<String>,
}

/// One pinned package record.
#[derive(Debug, Clone)]
pub struct LockEntry {
    /// Package name.
    pub name: String,
    /// Pinned version string.
    pub version: String,
    /// Pinned references to this package's own dependencies.
    pub dependencies: Vec<LockedDep>,
}

impl LockEntry {
    /// `<name>-<version>` key for this record.
    pub fn namever(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// The lockfile: the root crate's record plus every pinned package.
#[derive(Debug, Clone)]
pub struct Lockfile {
    /// The root crate's own record.
    pub root: LockEntry,
    /// Pinned records for every package in the graph.
    pub packages: Vec<LockEntry>,
}

#[derive(Deserialize)]
struct RawLockfile {
    root: Option<RawLockEntry>,
    #[serde(default)]
    package: Vec<RawLockEntry>,
}

#[derive(Deserialize)]
struct RawLockEntry {
    name: String,
    version: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

impl Lockfile {
    /// Load `<root_dir>/Cargo.lock`.
    pub fn load(root_dir: &Path) -> Result<Self, LockfileError> {
        let content = fs::read_to_string(root_dir.join("Cargo.lock"))?;
        Self::from_toml(&content)
    }

    /// Parse a lockfile from already-loaded TOML text.
    pub fn from_toml(content: &str) -> Result<Self, LockfileError> {
        let raw: RawLockfile = toml::from_str(content)?;
        let root = parse_entry(raw.root.ok_or(LockfileError::MissingRoot)?)?;
        let packages = raw
            .package
            .into_iter()
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { root, packages })
    }

    /// Find the record pinning `name` at exactly `version`, searching the
    /// root record first.
    pub fn find(&self, name: &str, version: &str) -> Option<&LockEntry> {
        std::iter::once(&self.root)
            .chain(self.packages.iter())
            .find(|e| e.name == name && e.version == version)
    }
}

fn parse_entry(raw: RawLockEntry) -> Result<LockEntry, LockfileError> {
    let dependencies = raw
        .dependencies
        .iter()
        .map(|entry| {
            let caps = DEP_RE
                .captures(entry)
                .ok_or_else(|| LockfileError::MalformedDependency {
                    name: raw.name.clone(),
                    entry: entry.clone(),
                })?;
            Ok(LockedDep {
                name: caps[1].to_string(),
                version: caps[2].to_string(),
                source: caps.get(3).map(|m| m.as_str().to_string()),
            })
        })
        .collect::<Result<Vec<_>, LockfileError>>()?;
    Ok(LockEntry {
        name: raw.name,
        version: raw.version,
        dependencies,
    })
}
