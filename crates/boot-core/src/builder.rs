//! Build orchestration: rustc invocation and the build-script protocol.
//!
//! Crates build depth-first: every dependency finishes before its dependent
//! starts, and within one crate the build script compiles and runs before
//! any lib or bin target. Each compile is a blocking `rustc` subprocess; a
//! build failure anywhere aborts the whole walk.
//!
//! ## Environment contract
//!
//! Build scripts and compiles receive exactly these variables:
//!
//! | Variable | Value |
//! |---|---|
//! | `PATH` | Inherited from the ambient environment |
//! | `OUT_DIR` | The artifact directory |
//! | `TARGET` / `HOST` | The target triple |
//! | `NUM_JOBS` | `1` |
//! | `OPT_LEVEL` / `DEBUG` | `0` |
//! | `PROFILE` | `release` |
//! | `CARGO_MANIFEST_DIR` | The crate's source directory |
//! | `CARGO_PKG_VERSION` | Full version, plus `_MAJOR`/`_MINOR`/`_PATCH`/`_PRE` parts |
//! | `CARGO_FEATURE_<F>` | `1` per enabled feature (uppercased, dashes to underscores) |
//! | `DEP_<PKG>_<KEY>` | Metadata exported by dependencies' build scripts |
//!
//! ## Directive protocol
//!
//! Build-script stdout lines matching `cargo:<key>(=<value>)?` steer the
//! crate's remaining compiles: `rustc-link-lib` appends `-l`,
//! `rustc-link-search` appends `-L`, `rustc-cfg` appends `--cfg` and sets
//! the matching `CARGO_FEATURE_*` variable, and any other key is exported
//! to dependents as `DEP_<PKG>_<KEY>`, where `<PKG>` is the build-script
//! target name with a leading `lib` stripped and truncated at the first
//! underscore.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::manifest::{BuildTarget, TargetKind, flat};
use crate::semver::Version;

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^cargo:(?P<key>[^\s=]+)(=(?P<value>.+))?$").expect("directive regex is valid")
});

static PKG_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(lib)?(?P<name>[^_]+)(_.*)?$").expect("pkg key regex is valid"));

/// Errors produced while building.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The requested crate was never resolved into the graph.
    #[error("crate {0} is not in the build graph")]
    UnknownCrate(String),

    /// A subprocess could not be spawned at all.
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A compile or build-script subprocess exited non-zero.
    #[error("{stage} failed for {krate} (exit code {code:?})")]
    BuildFailed {
        /// Crate whose build failed.
        krate: String,
        /// The stage that failed.
        stage: String,
        /// Exit code, when the process was not killed by a signal.
        code: Option<i32>,
    },
}

/// The memoized result of building one crate.
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    /// Crate name.
    pub name: String,
    /// Name dependents bind with `--extern`: the declared lib target name,
    /// flattened.
    pub extern_name: String,
    /// The compiled rlib path.
    pub lib_path: PathBuf,
    /// `DEP_<PKG>_<KEY>` metadata exported to dependents.
    pub exported_env: BTreeMap<String, String>,
    /// Link flags propagated upward: the crate's own build-script flags
    /// plus everything inherited from its dependencies.
    pub extra_flags: Vec<String>,
}

/// One queued subprocess step.
enum Invocation {
    /// A rustc compile.
    Rustc { args: Vec<String> },
    /// Execution of a compiled build-script binary.
    BuildScript { program: PathBuf, cwd: PathBuf },
}

/// What one subprocess contributed.
#[derive(Default)]
struct InvocationOutcome {
    /// Flags for the crate's remaining compiles.
    extra_flags: Vec<String>,
    /// Extra environment for the crate's remaining subprocesses.
    extra_env: BTreeMap<String, String>,
    /// Raw metadata keys exported to dependents.
    metadata: BTreeMap<String, String>,
}

/// A parsed `cargo:` directive line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    LinkLib(String),
    LinkSearch(String),
    Cfg(String),
    Metadata(String, String),
}

/// The rlib path a lib target of `name`/`version` compiles to.
pub fn lib_output_path(out_dir: &Path, name: &str, version: &str) -> PathBuf {
    out_dir.join(format!("lib{}-{}.rlib", flat(name), flat(version)))
}

/// Build one crate and everything it depends on, memoized.
///
/// Dependencies build first; their extern descriptors, exported metadata,
/// and link flags feed the crate's own compiles. A crate whose rlib already
/// exists on disk is skipped without spawning anything.
///
/// # Errors
///
/// Fails when a subprocess cannot be spawned or exits non-zero; the first
/// failure aborts the walk.
pub fn build(
    ctx: &mut BuildContext,
    namever: &str,
    needed_by: &str,
) -> Result<BuildOutcome, BuildError> {
    if let Some(done) = ctx.built(namever) {
        return Ok(done.clone());
    }

    let (manifest, source_dir, dep_keys, features) = {
        let node = ctx
            .node(namever)
            .ok_or_else(|| BuildError::UnknownCrate(namever.to_string()))?;
        (
            node.manifest.clone(),
            node.source_dir.clone(),
            node.deps.keys().cloned().collect::<Vec<_>>(),
            node.enabled_features.clone(),
        )
    };

    // dependencies first
    let mut externs: Vec<(String, PathBuf)> = Vec::new();
    let mut dep_env: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut extra_flags: Vec<String> = Vec::new();
    for dep_nv in &dep_keys {
        let outcome = build(ctx, dep_nv, namever)?;
        externs.push((outcome.extern_name.clone(), outcome.lib_path.clone()));
        dep_env.insert(outcome.name.clone(), outcome.exported_env.clone());
        extra_flags.extend(outcome.extra_flags.clone());
    }

    let version = manifest.version.to_string();
    // rustc names the artifact after the lib target, which only defaults to
    // the crate name; the extern binding and the output probe must agree
    let lib_name = manifest.lib_name().unwrap_or(&manifest.name).to_string();
    let extern_name = flat(&lib_name);
    let output = lib_output_path(&ctx.out_dir, &lib_name, &version);

    if output.is_file() {
        info!("skipping {namever}, already built (needed by {needed_by})");
        let outcome = BuildOutcome {
            name: manifest.name,
            extern_name,
            lib_path: output,
            exported_env: BTreeMap::new(),
            extra_flags,
        };
        ctx.mark_built(namever.to_string(), outcome.clone());
        return Ok(outcome);
    }

    info!("building {namever} (needed by {needed_by})");

    let env = base_env(
        &ctx.target,
        &ctx.host,
        &ctx.out_dir,
        &source_dir,
        &manifest.version,
        features.iter().map(String::as_str),
        &dep_env,
    );

    // build script first, then libs, then bins; declaration order within kinds
    let mut ordered: Vec<&BuildTarget> = manifest.targets.iter().collect();
    ordered.sort_by_key(|t| match t.kind {
        TargetKind::BuildScript => 0,
        TargetKind::Lib => 1,
        TargetKind::Bin => 2,
    });

    let flat_version = flat(&version);
    let mut steps: Vec<(String, String, Invocation)> = Vec::new();
    for target in ordered {
        let flat_name = flat(&target.name);
        let crate_name = match target.kind {
            TargetKind::BuildScript => format!("build_script_{flat_name}"),
            _ => flat_name,
        };
        let args = compile_args(
            target,
            &crate_name,
            &flat_version,
            &ctx.out_dir,
            &ctx.target,
            features.iter().map(String::as_str),
            &extra_flags,
            &externs,
        );
        let key = pkg_key(&target.name);
        steps.push((
            format!("compiling `{}`", target.name),
            key.clone(),
            Invocation::Rustc { args },
        ));
        if target.kind == TargetKind::BuildScript {
            let program = ctx.out_dir.join(format!("{crate_name}-{flat_version}"));
            steps.push((
                format!("running build script `{}`", target.name),
                key,
                Invocation::BuildScript {
                    program,
                    cwd: source_dir.clone(),
                },
            ));
        }
    }

    let mut pending_flags: Vec<String> = Vec::new();
    let mut pending_env: BTreeMap<String, String> = BTreeMap::new();
    let mut exported_env: BTreeMap<String, String> = BTreeMap::new();
    for (stage, key, invocation) in steps {
        let result = run_invocation(
            &ctx.rustc,
            &invocation,
            &env,
            &pending_flags,
            &pending_env,
            namever,
            &stage,
        )?;
        pending_flags.extend(result.extra_flags);
        pending_env.extend(result.extra_env);
        for (meta_key, value) in result.metadata {
            exported_env.insert(
                format!("DEP_{}_{}", key.to_uppercase(), meta_key.to_uppercase()),
                value,
            );
        }
    }

    // own build-script flags propagate upward along with inherited ones
    extra_flags.extend(pending_flags);
    let outcome = BuildOutcome {
        name: manifest.name,
        extern_name,
        lib_path: output,
        exported_env,
        extra_flags,
    };
    ctx.mark_built(namever.to_string(), outcome.clone());
    Ok(outcome)
}

/// Assemble the environment shared by every subprocess of one crate.
fn base_env<'a>(
    target: &str,
    host: &str,
    out_dir: &Path,
    source_dir: &Path,
    version: &Version,
    features: impl Iterator<Item = &'a str>,
    dep_env: &BTreeMap<String, BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_default(),
    );
    env.insert("OUT_DIR".to_string(), out_dir.display().to_string());
    env.insert("TARGET".to_string(), target.to_string());
    env.insert("HOST".to_string(), host.to_string());
    env.insert("NUM_JOBS".to_string(), "1".to_string());
    env.insert("OPT_LEVEL".to_string(), "0".to_string());
    env.insert("DEBUG".to_string(), "0".to_string());
    env.insert("PROFILE".to_string(), "release".to_string());
    env.insert(
        "CARGO_MANIFEST_DIR".to_string(),
        source_dir.display().to_string(),
    );
    env.insert("CARGO_PKG_VERSION".to_string(), version.to_string());
    env.insert(
        "CARGO_PKG_VERSION_MAJOR".to_string(),
        version.major().to_string(),
    );
    env.insert(
        "CARGO_PKG_VERSION_MINOR".to_string(),
        version.minor().to_string(),
    );
    env.insert(
        "CARGO_PKG_VERSION_PATCH".to_string(),
        version.patch().to_string(),
    );
    env.insert(
        "CARGO_PKG_VERSION_PRE".to_string(),
        version.pre().to_string(),
    );
    for feature in features {
        env.insert(format!("CARGO_FEATURE_{}", feature_env(feature)), "1".to_string());
    }
    for exported in dep_env.values() {
        for (key, value) in exported {
            env.insert(key.clone(), value.clone());
        }
    }
    env
}

/// Synthesize the rustc argument list for one target.
#[allow(clippy::too_many_arguments)]
fn compile_args<'a>(
    target: &BuildTarget,
    crate_name: &str,
    flat_version: &str,
    out_dir: &Path,
    triple: &str,
    features: impl Iterator<Item = &'a str>,
    extra_flags: &[String],
    externs: &[(String, PathBuf)],
) -> Vec<String> {
    let mut args = vec![
        target.source_path.display().to_string(),
        "--crate-name".to_string(),
        crate_name.to_string(),
        "--crate-type".to_string(),
        match target.kind {
            TargetKind::Lib => "lib".to_string(),
            _ => "bin".to_string(),
        },
    ];
    for feature in features {
        args.push("--cfg".to_string());
        args.push(format!("feature=\"{feature}\""));
    }
    args.push("-C".to_string());
    args.push(format!("extra-filename=-{flat_version}"));
    args.push("--out-dir".to_string());
    args.push(out_dir.display().to_string());
    args.push("--emit=dep-info,link".to_string());
    args.push("--target".to_string());
    args.push(triple.to_string());
    args.push("-L".to_string());
    args.push(out_dir.display().to_string());
    args.push("-L".to_string());
    args.push(out_dir.join("lib").display().to_string());
    args.extend(extra_flags.iter().cloned());
    for (name, lib) in externs {
        args.push("--extern".to_string());
        args.push(format!("{name}={}", lib.display()));
    }
    args
}

/// Run one queued subprocess, forwarding its stderr and harvesting `cargo:`
/// directives from build-script stdout.
fn run_invocation(
    rustc: &Path,
    invocation: &Invocation,
    base_env: &BTreeMap<String, String>,
    pending_flags: &[String],
    pending_env: &BTreeMap<String, String>,
    krate: &str,
    stage: &str,
) -> Result<InvocationOutcome, BuildError> {
    let (mut command, program) = match invocation {
        Invocation::Rustc { args } => {
            let mut cmd = Command::new(rustc);
            cmd.args(args).args(pending_flags);
            (cmd, rustc.display().to_string())
        }
        Invocation::BuildScript { program, cwd } => {
            let mut cmd = Command::new(program);
            cmd.current_dir(cwd);
            (cmd, program.display().to_string())
        }
    };
    command.env_clear().envs(base_env).envs(pending_env);

    debug!("{stage} for {krate}: {command:?}");
    let output = command.output().map_err(|source| BuildError::Spawn {
        program: program.clone(),
        source,
    })?;

    // diagnostics stream through in arrival order
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if !line.is_empty() {
            eprintln!("{line}");
        }
    }

    if !output.status.success() {
        return Err(BuildError::BuildFailed {
            krate: krate.to_string(),
            stage: stage.to_string(),
            code: output.status.code(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut outcome = InvocationOutcome::default();
    if matches!(invocation, Invocation::BuildScript { .. }) {
        for line in stdout.lines() {
            let Some(directive) = parse_directive(line) else {
                continue;
            };
            match directive {
                Directive::LinkLib(lib) => {
                    outcome.extra_flags.push("-l".to_string());
                    outcome.extra_flags.push(lib);
                }
                Directive::LinkSearch(path) => {
                    outcome.extra_flags.push("-L".to_string());
                    outcome.extra_flags.push(path);
                }
                Directive::Cfg(cfg) => {
                    outcome
                        .extra_env
                        .insert(format!("CARGO_FEATURE_{}", feature_env(&cfg)), "1".to_string());
                    outcome.extra_flags.push("--cfg".to_string());
                    outcome.extra_flags.push(cfg);
                }
                Directive::Metadata(key, value) => {
                    outcome.metadata.insert(key, value);
                }
            }
        }
    } else {
        for line in stdout.lines() {
            if !line.is_empty() {
                debug!("{line}");
            }
        }
    }
    Ok(outcome)
}

/// Parse one build-script stdout line. Returns `None` for lines that are
/// not directives and for `rustc-*` directives missing their value.
fn parse_directive(line: &str) -> Option<Directive> {
    let caps = DIRECTIVE_RE.captures(line)?;
    let key = caps.name("key")?.as_str();
    let value = caps.name("value").map(|m| m.as_str());
    match (key, value) {
        ("rustc-link-lib", Some(v)) => Some(Directive::LinkLib(v.to_string())),
        ("rustc-link-search", Some(v)) => Some(Directive::LinkSearch(v.to_string())),
        ("rustc-cfg", Some(v)) => Some(Directive::Cfg(v.to_string())),
        ("rustc-link-lib" | "rustc-link-search" | "rustc-cfg", None) => {
            warn!("ignoring `cargo:{key}` directive with no value");
            None
        }
        (key, value) => Some(Directive::Metadata(
            key.to_string(),
            value.unwrap_or_default().to_string(),
        )),
    }
}

/// The `DEP_<PKG>_...` prefix for a build-script target: strip a leading
/// `lib`, truncate at the first underscore.
fn pkg_key(target_name: &str) -> String {
    PKG_KEY_RE
        .captures(target_name)
        .and_then(|caps| caps.name("name"))
        .map_or_else(|| flat(target_name), |m| flat(m.as_str()))
}

/// `CARGO_FEATURE_*` suffix for a feature or cfg name.
fn feature_env(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat() {
        assert_eq!(flat("demo-dep"), "demo_dep");
        assert_eq!(flat("1.2.3"), "1_2_3");
        assert_eq!(flat("1.0.0-alpha"), "1_0_0_alpha");
    }

    #[test]
    fn test_lib_output_path() {
        let path = lib_output_path(Path::new("/out"), "demo-dep", "1.2.3");
        assert_eq!(path, PathBuf::from("/out/libdemo_dep-1_2_3.rlib"));
    }

    #[test]
    fn test_pkg_key() {
        assert_eq!(pkg_key("demo_dep"), "demo");
        assert_eq!(pkg_key("libz_sys"), "z");
        assert_eq!(pkg_key("build"), "build");
        assert_eq!(pkg_key("libc"), "c");
    }

    #[test]
    fn test_feature_env() {
        assert_eq!(feature_env("serde-derive"), "SERDE_DERIVE");
        assert_eq!(feature_env("has_bar"), "HAS_BAR");
    }

    #[test]
    fn test_parse_directive() {
        assert_eq!(
            parse_directive("cargo:rustc-link-lib=foo"),
            Some(Directive::LinkLib("foo".to_string()))
        );
        assert_eq!(
            parse_directive("cargo:rustc-link-search=/opt/lib"),
            Some(Directive::LinkSearch("/opt/lib".to_string()))
        );
        assert_eq!(
            parse_directive("cargo:rustc-cfg=has_bar"),
            Some(Directive::Cfg("has_bar".to_string()))
        );
        assert_eq!(
            parse_directive("cargo:include=/usr/include/x"),
            Some(Directive::Metadata(
                "include".to_string(),
                "/usr/include/x".to_string()
            ))
        );
        // ordinary output is not a directive
        assert_eq!(parse_directive("compiling foo"), None);
        // rustc directives without a value are dropped
        assert_eq!(parse_directive("cargo:rustc-link-lib"), None);
        // bare metadata keys export an empty value
        assert_eq!(
            parse_directive("cargo:flagged"),
            Some(Directive::Metadata("flagged".to_string(), String::new()))
        );
    }

    #[test]
    fn test_base_env() {
        let version: Version = "1.2.3-rc.1".parse().unwrap();
        let mut dep_env = BTreeMap::new();
        dep_env.insert(
            "demo".to_string(),
            [("DEP_DEMO_INCLUDE".to_string(), "/usr/include/x".to_string())]
                .into_iter()
                .collect(),
        );

        let env = base_env(
            "x86_64-unknown-linux-gnu",
            "x86_64-unknown-linux-gnu",
            Path::new("/out"),
            Path::new("/src/demo"),
            &version,
            ["std", "serde-derive"].into_iter(),
            &dep_env,
        );

        assert_eq!(env["OUT_DIR"], "/out");
        assert_eq!(env["TARGET"], "x86_64-unknown-linux-gnu");
        assert_eq!(env["NUM_JOBS"], "1");
        assert_eq!(env["PROFILE"], "release");
        assert_eq!(env["CARGO_MANIFEST_DIR"], "/src/demo");
        assert_eq!(env["CARGO_PKG_VERSION"], "1.2.3-rc.1");
        assert_eq!(env["CARGO_PKG_VERSION_MAJOR"], "1");
        assert_eq!(env["CARGO_PKG_VERSION_MINOR"], "2");
        assert_eq!(env["CARGO_PKG_VERSION_PATCH"], "3");
        assert_eq!(env["CARGO_PKG_VERSION_PRE"], "rc.1");
        assert_eq!(env["CARGO_FEATURE_STD"], "1");
        assert_eq!(env["CARGO_FEATURE_SERDE_DERIVE"], "1");
        assert_eq!(env["DEP_DEMO_INCLUDE"], "/usr/include/x");
    }

    #[test]
    fn test_compile_args_shape() {
        let target = BuildTarget {
            kind: TargetKind::Lib,
            name: "demo-dep".to_string(),
            source_path: PathBuf::from("/src/demo/src/lib.rs"),
            links: Vec::new(),
            overrides: toml::Table::new(),
        };
        let externs = vec![("base".to_string(), PathBuf::from("/out/libbase-0_3_0.rlib"))];
        let extra = vec!["-l".to_string(), "foo".to_string()];
        let args = compile_args(
            &target,
            "demo_dep",
            "1_2_3",
            Path::new("/out"),
            "x86_64-unknown-linux-gnu",
            ["std"].into_iter(),
            &extra,
            &externs,
        );

        let joined = args.join(" ");
        assert!(joined.starts_with("/src/demo/src/lib.rs --crate-name demo_dep --crate-type lib"));
        assert!(joined.contains("--cfg feature=\"std\""));
        assert!(joined.contains("-C extra-filename=-1_2_3"));
        assert!(joined.contains("--out-dir /out"));
        assert!(joined.contains("--emit=dep-info,link"));
        assert!(joined.contains("--target x86_64-unknown-linux-gnu"));
        assert!(joined.contains("-L /out -L /out/lib"));
        // inherited flags come before externs
        assert!(
            joined.find("-l foo").unwrap() < joined.find("--extern").unwrap(),
            "{joined}"
        );
        assert!(joined.ends_with("--extern base=/out/libbase-0_3_0.rlib"));
    }
}
