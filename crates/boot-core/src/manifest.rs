//! Crate manifest loading and normalization.
//!
//! Reads a `Cargo.toml` into a [`CrateManifest`]: identity, declared
//! dependencies, build targets, and the feature table. The reader accepts the
//! legacy `[project]` table as an alias for `[package]`, normalizes
//! singleton-or-list forms (`links`, `[lib]`, `[[bin]]`), synthesizes the
//! default lib target when nothing is declared, and resolves each target's
//! source path against the conventional candidate locations.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::semver::{Version, VersionError, VersionRange};

/// Errors produced while loading a crate manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the manifest that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The manifest is not valid TOML or misses required tables.
    #[error("invalid manifest: {0}")]
    Invalid(String),

    /// TOML syntax or schema error.
    #[error("invalid manifest: {0}")]
    Toml(#[from] toml::de::Error),

    /// A version or requirement string failed to parse.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// No candidate source file exists for a build target.
    #[error("no source file found for target `{name}` under {dir}")]
    MissingSource {
        /// Name of the target whose source could not be located.
        name: String,
        /// Crate directory that was probed.
        dir: PathBuf,
    },
}

/// How a dependency participates in the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// A `[dependencies]` entry (including target-specific ones).
    Normal,
    /// A `[build-dependencies]` entry.
    Build,
    /// A `[dev-dependencies]` entry; skipped by the resolver.
    Dev,
}

/// A declared dependency, normalized from the scalar or table form.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Registry name of the dependency.
    pub name: String,
    /// Declared version requirement. Always-satisfied for local deps.
    pub requirement: VersionRange,
    /// Features the dependent asks for.
    pub features: Vec<String>,
    /// Whether the dependency is optional (gated behind a feature).
    pub optional: bool,
    /// Whether the dependency's `default` feature is enabled.
    pub default_features: bool,
    /// Dependency kind.
    pub kind: DepKind,
    /// Filesystem location for path dependencies declared without a version.
    pub local_path: Option<PathBuf>,
}

impl Dependency {
    /// Local (path) dependencies are pinned by location; version predicates
    /// do not apply to them.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }
}

/// What a build target compiles into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A library target (`--crate-type lib`).
    Lib,
    /// An executable target (`--crate-type bin`).
    Bin,
    /// The crate's build script, compiled then executed before other targets.
    BuildScript,
}

/// A normalized build target with its source path already resolved.
#[derive(Debug, Clone)]
pub struct BuildTarget {
    /// Target kind.
    pub kind: TargetKind,
    /// Declared target name (un-flattened).
    pub name: String,
    /// Resolved source file.
    pub source_path: PathBuf,
    /// Native libraries this crate links (`package.links`).
    pub links: Vec<String>,
    /// Target-specific override tables keyed by linked library.
    pub overrides: toml::Table,
}

/// A crate manifest after normalization.
#[derive(Debug, Clone)]
pub struct CrateManifest {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: Version,
    /// Merged dependency list (build, normal, and target-specific).
    pub dependencies: Vec<Dependency>,
    /// Build targets in declaration order.
    pub targets: Vec<BuildTarget>,
    /// The `[features]` table.
    pub features: BTreeMap<String, Vec<String>>,
    /// Features enabled by default (the `default` closure).
    pub enabled_features: BTreeSet<String>,
}

/// Replace `-` and `.` with `_`, the form rustc accepts for crate names and
/// the form used in output file names.
pub fn flat(s: &str) -> String {
    s.replace(['-', '.'], "_")
}

/// Expand `seeds` through a feature table, following feature-to-feature
/// edges recursively. A visited set guards against cycles.
pub fn expand_features(
    table: &BTreeMap<String, Vec<String>>,
    seeds: impl IntoIterator<Item = String>,
) -> BTreeSet<String> {
    let mut enabled = BTreeSet::new();
    let mut stack: Vec<String> = seeds.into_iter().collect();
    while let Some(feature) = stack.pop() {
        if !enabled.insert(feature.clone()) {
            continue;
        }
        if let Some(implied) = table.get(&feature) {
            stack.extend(implied.iter().cloned());
        }
    }
    enabled
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

#[derive(Deserialize)]
struct RawPackage {
    name: Option<String>,
    version: Option<String>,
    links: Option<OneOrMany<String>>,
    build: Option<String>,
}

#[derive(Deserialize)]
struct RawLib {
    name: Option<String>,
    path: Option<String>,
}

#[derive(Deserialize)]
struct RawBin {
    name: String,
    path: Option<String>,
}

#[derive(Deserialize, Clone)]
#[serde(untagged)]
enum RawDependency {
    Requirement(String),
    Detailed(Box<RawDepTable>),
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
struct RawDepTable {
    version: Option<String>,
    path: Option<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    optional: bool,
    #[serde(default = "default_true", alias = "default_features")]
    default_features: bool,
}

#[derive(Deserialize, Default)]
struct RawTargetBlock {
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
    #[serde(flatten)]
    rest: toml::Table,
}

#[derive(Deserialize)]
struct RawManifest {
    package: Option<RawPackage>,
    project: Option<RawPackage>,
    lib: Option<OneOrMany<RawLib>>,
    bin: Option<OneOrMany<RawBin>>,
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
    #[serde(default, rename = "build-dependencies")]
    build_dependencies: BTreeMap<String, RawDependency>,
    #[serde(default, rename = "dev-dependencies")]
    dev_dependencies: BTreeMap<String, RawDependency>,
    #[serde(default)]
    target: BTreeMap<String, RawTargetBlock>,
    #[serde(default)]
    features: BTreeMap<String, Vec<String>>,
}

impl CrateManifest {
    /// Load and normalize `<crate_dir>/Cargo.toml`.
    ///
    /// `target_triple` selects which `[target.<triple>.dependencies]` block
    /// applies.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invalid`] when identity is missing or when
    /// `links` is declared without `build`, [`ManifestError::MissingSource`]
    /// when a target's source file cannot be located, and parse errors for
    /// malformed TOML or version strings.
    pub fn load(crate_dir: &Path, target_triple: &str) -> Result<Self, ManifestError> {
        let path = crate_dir.join("Cargo.toml");
        let content = fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&content, crate_dir, target_triple)
    }

    /// Normalize a manifest from already-loaded TOML text.
    pub fn from_toml(
        content: &str,
        crate_dir: &Path,
        target_triple: &str,
    ) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(content)?;

        let package = raw
            .package
            .or(raw.project)
            .ok_or_else(|| ManifestError::Invalid("missing [package] or [project] table".into()))?;
        let name = package
            .name
            .ok_or_else(|| ManifestError::Invalid("missing package name".into()))?;
        let version: Version = package
            .version
            .ok_or_else(|| ManifestError::Invalid("missing package version".into()))?
            .parse()?;

        let links: Vec<String> = package.links.map(OneOrMany::into_vec).unwrap_or_default();
        if !links.is_empty() && package.build.is_none() {
            return Err(ManifestError::Invalid(format!(
                "package `{name}` declares `links` without a `build` script"
            )));
        }

        let target_block = raw.target.get(target_triple);

        // build script first, then libs, then bins; the builder preserves
        // this order within each kind
        let mut targets = Vec::new();
        if let Some(build_file) = &package.build {
            let mut overrides = toml::Table::new();
            if let Some(block) = target_block {
                for link in &links {
                    if let Some(toml::Value::Table(t)) = block.rest.get(link) {
                        overrides.extend(t.clone());
                    }
                }
            }
            targets.push(resolve_target(
                crate_dir,
                TargetKind::BuildScript,
                flat(&name),
                &[build_file.clone()],
                links.clone(),
                overrides,
            )?);
        }

        let mut has_main_target = false;
        for lib in raw.lib.map(OneOrMany::into_vec).unwrap_or_default() {
            let lib_name = lib.name.unwrap_or_else(|| flat(&name));
            let candidates = [lib.path.unwrap_or_else(|| "lib.rs".to_string())];
            targets.push(resolve_target(
                crate_dir,
                TargetKind::Lib,
                lib_name,
                &candidates,
                links.clone(),
                toml::Table::new(),
            )?);
            has_main_target = true;
        }
        for bin in raw.bin.map(OneOrMany::into_vec).unwrap_or_default() {
            let candidates = match bin.path {
                Some(path) => vec![path],
                None => vec![
                    format!("bin/{}.rs", bin.name),
                    "bin/main.rs".to_string(),
                    format!("{}.rs", bin.name),
                    "main.rs".to_string(),
                ],
            };
            targets.push(resolve_target(
                crate_dir,
                TargetKind::Bin,
                bin.name,
                &candidates,
                links.clone(),
                toml::Table::new(),
            )?);
            has_main_target = true;
        }
        if !has_main_target {
            targets.push(resolve_target(
                crate_dir,
                TargetKind::Lib,
                flat(&name),
                &["lib.rs".to_string()],
                Vec::new(),
                toml::Table::new(),
            )?);
        }

        // later tables override earlier ones for the same name
        let mut merged: BTreeMap<String, (RawDependency, DepKind)> = BTreeMap::new();
        for (dep_name, dep) in raw.build_dependencies {
            merged.insert(dep_name, (dep, DepKind::Build));
        }
        for (dep_name, dep) in raw.dependencies {
            merged.insert(dep_name, (dep, DepKind::Normal));
        }
        if let Some(block) = target_block {
            for (dep_name, dep) in &block.dependencies {
                merged.insert(dep_name.clone(), (dep.clone(), DepKind::Normal));
            }
        }
        for (dep_name, dep) in raw.dev_dependencies {
            merged.entry(dep_name).or_insert((dep, DepKind::Dev));
        }

        let mut dependencies = Vec::new();
        for (dep_name, (dep, kind)) in merged {
            dependencies.push(normalize_dependency(crate_dir, dep_name, dep, kind)?);
        }

        let enabled_features = if raw.features.contains_key("default") {
            expand_features(&raw.features, ["default".to_string()])
        } else {
            BTreeSet::new()
        };

        Ok(Self {
            name,
            version,
            dependencies,
            targets,
            features: raw.features,
            enabled_features,
        })
    }

    /// `<name>-<version>`, the key under which this crate is registered.
    pub fn namever(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// The declared name of the first lib target, if any. This is the name
    /// dependents bind with `--extern`.
    pub fn lib_name(&self) -> Option<&str> {
        self.targets
            .iter()
            .find(|t| t.kind == TargetKind::Lib)
            .map(|t| t.name.as_str())
    }
}

fn normalize_dependency(
    crate_dir: &Path,
    name: String,
    dep: RawDependency,
    kind: DepKind,
) -> Result<Dependency, ManifestError> {
    match dep {
        RawDependency::Requirement(req) => Ok(Dependency {
            name,
            requirement: req.parse()?,
            features: Vec::new(),
            optional: false,
            default_features: true,
            kind,
            local_path: None,
        }),
        RawDependency::Detailed(table) => {
            let (requirement, local_path) = match (&table.version, &table.path) {
                // a path without a version pins by location, not by version
                (None, Some(path)) => (VersionRange::any(), Some(crate_dir.join(path))),
                (Some(version), _) => (version.parse()?, None),
                (None, None) => {
                    return Err(ManifestError::Invalid(format!(
                        "dependency `{name}` has neither a version nor a path"
                    )));
                }
            };
            Ok(Dependency {
                name,
                requirement,
                features: table.features,
                optional: table.optional,
                default_features: table.default_features,
                kind,
                local_path,
            })
        }
    }
}

/// Probe `<dir>/<candidate>` then `<dir>/src/<candidate>` for each candidate
/// in order; the first existing file wins.
fn resolve_target(
    crate_dir: &Path,
    kind: TargetKind,
    name: String,
    candidates: &[String],
    links: Vec<String>,
    overrides: toml::Table,
) -> Result<BuildTarget, ManifestError> {
    for candidate in candidates {
        for probe in [crate_dir.join(candidate), crate_dir.join("src").join(candidate)] {
            if probe.is_file() {
                return Ok(BuildTarget {
                    kind,
                    name,
                    source_path: probe,
                    links,
                    overrides,
                });
            }
        }
    }
    Err(ManifestError::MissingSource {
        name,
        dir: crate_dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const TRIPLE: &str = "x86_64-unknown-linux-gnu";

    fn write_crate(dir: &Path, manifest: &str, files: &[&str]) {
        fs::write(dir.join("Cargo.toml"), manifest).unwrap();
        for file in files {
            let path = dir.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "").unwrap();
        }
    }

    #[test]
    fn test_default_lib_target() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[package]\nname = \"my-crate\"\nversion = \"0.1.0\"\n",
            &["src/lib.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        assert_eq!(manifest.name, "my-crate");
        assert_eq!(manifest.targets.len(), 1);
        let target = &manifest.targets[0];
        assert_eq!(target.kind, TargetKind::Lib);
        assert_eq!(target.name, "my_crate");
        assert_eq!(target.source_path, tmp.path().join("src/lib.rs"));
    }

    #[test]
    fn test_legacy_project_table() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[project]\nname = \"old\"\nversion = \"1.0.0\"\n",
            &["lib.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        assert_eq!(manifest.name, "old");
        assert_eq!(manifest.targets[0].source_path, tmp.path().join("lib.rs"));
    }

    #[test]
    fn test_links_requires_build() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[package]\nname = \"z-sys\"\nversion = \"0.1.0\"\nlinks = \"z\"\n",
            &["src/lib.rs"],
        );

        let err = CrateManifest::load(tmp.path(), TRIPLE).unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)), "{err}");
    }

    #[test]
    fn test_build_script_ordering_and_name() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[package]\nname = \"z-sys\"\nversion = \"0.1.0\"\nlinks = \"z\"\nbuild = \"build.rs\"\n",
            &["build.rs", "src/lib.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        assert_eq!(manifest.targets.len(), 2);
        assert_eq!(manifest.targets[0].kind, TargetKind::BuildScript);
        assert_eq!(manifest.targets[0].name, "z_sys");
        assert_eq!(manifest.targets[0].links, vec!["z".to_string()]);
        assert_eq!(manifest.targets[1].kind, TargetKind::Lib);
    }

    #[test]
    fn test_bin_path_candidates() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[package]\nname = \"tool\"\nversion = \"0.1.0\"\n\n[[bin]]\nname = \"tool\"\n",
            &["src/bin/main.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        assert_eq!(manifest.targets.len(), 1);
        assert_eq!(manifest.targets[0].kind, TargetKind::Bin);
        assert_eq!(
            manifest.targets[0].source_path,
            tmp.path().join("src/bin/main.rs")
        );
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[package]\nname = \"nothing\"\nversion = \"0.1.0\"\n",
            &[],
        );

        let err = CrateManifest::load(tmp.path(), TRIPLE).unwrap_err();
        assert!(matches!(err, ManifestError::MissingSource { .. }), "{err}");
    }

    #[test]
    fn test_dependency_merge_precedence() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            &format!(
                r#"
[package]
name = "top"
version = "0.1.0"

[build-dependencies]
gcc = "0.3"
shared = "0.1"

[dependencies]
shared = "0.2"
serde = {{ version = "0.6", optional = true, default-features = false }}

[target.{TRIPLE}.dependencies]
libc = "0.2"
"#
            ),
            &["src/lib.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        let dep = |name: &str| {
            manifest
                .dependencies
                .iter()
                .find(|d| d.name == name)
                .unwrap_or_else(|| panic!("dependency {name}"))
        };

        assert_eq!(dep("gcc").kind, DepKind::Build);
        // [dependencies] overrides [build-dependencies] for the same name
        assert_eq!(dep("shared").kind, DepKind::Normal);
        assert_eq!(dep("shared").requirement.to_string(), "0.2");
        assert_eq!(dep("libc").kind, DepKind::Normal);
        assert!(dep("serde").optional);
        assert!(!dep("serde").default_features);
    }

    #[test]
    fn test_local_path_dependency() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[package]\nname = \"top\"\nversion = \"0.1.0\"\n\n[dependencies]\nhelper = { path = \"helper\" }\n",
            &["src/lib.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        let dep = &manifest.dependencies[0];
        assert!(dep.is_local());
        assert_eq!(dep.local_path.as_deref(), Some(tmp.path().join("helper").as_path()));
        // location-pinned deps satisfy any version
        assert!(dep.requirement.satisfies(&"0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_default_feature_expansion_is_recursive() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            r#"
[package]
name = "feat"
version = "0.1.0"

[features]
default = ["std"]
std = ["alloc"]
alloc = []
"#,
            &["src/lib.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        let expected: BTreeSet<String> = ["default", "std", "alloc"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(manifest.enabled_features, expected);
    }

    #[test]
    fn test_feature_expansion_handles_cycles() {
        let table: BTreeMap<String, Vec<String>> = [
            ("a".to_string(), vec!["b".to_string()]),
            ("b".to_string(), vec!["a".to_string()]),
        ]
        .into_iter()
        .collect();
        let expanded = expand_features(&table, ["a".to_string()]);
        assert_eq!(expanded.len(), 2);
    }

    #[test]
    fn test_explicit_lib_name_is_tracked() {
        let tmp = tempdir().unwrap();
        write_crate(
            tmp.path(),
            "[package]\nname = \"winapi-build\"\nversion = \"0.1.0\"\n\n[lib]\nname = \"build\"\n",
            &["src/lib.rs"],
        );

        let manifest = CrateManifest::load(tmp.path(), TRIPLE).unwrap();
        assert_eq!(manifest.lib_name(), Some("build"));
    }
}
