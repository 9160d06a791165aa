//! High-level bootstrap flow: load, resolve, build.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::builder::{self, BuildOutcome};
use crate::context::BuildContext;
use crate::lockfile::Lockfile;
use crate::manifest::CrateManifest;
use crate::resolver;

/// Everything one bootstrap run needs.
#[derive(Debug)]
pub struct BootstrapOptions {
    /// Directory of the root crate (holds `Cargo.toml` and `Cargo.lock`).
    pub root_dir: PathBuf,
    /// Directory of downloaded `.crate` archives.
    pub cache_dir: PathBuf,
    /// Directory receiving build artifacts.
    pub out_dir: PathBuf,
    /// Target triple passed to every compile.
    pub target: String,
    /// Compiler driver; `rustc` when not overridden.
    pub rustc: Option<PathBuf>,
    /// Dependency names to skip outright.
    pub blacklist: Vec<String>,
    /// Optional dependencies to enable from outside the graph.
    pub optionals: Vec<String>,
}

/// Bootstrap the root crate: load its manifest and lockfile, resolve the
/// dependency graph, and build everything bottom-up.
///
/// # Errors
///
/// Surfaces the first manifest, lockfile, resolution, or build failure;
/// nothing is retried.
pub fn bootstrap(options: BootstrapOptions) -> Result<BuildOutcome> {
    info!(
        "bootstrapping {} for {}",
        options.root_dir.display(),
        options.target
    );

    // absolute paths end up in compile commands and CARGO_MANIFEST_DIR
    let root_dir = options
        .root_dir
        .canonicalize()
        .context("root crate directory not found")?;
    let cache_dir = options
        .cache_dir
        .canonicalize()
        .context("cache directory not found")?;
    fs::create_dir_all(&options.out_dir).context("failed to create the target directory")?;
    let out_dir = options
        .out_dir
        .canonicalize()
        .context("target directory not found")?;

    let manifest =
        CrateManifest::load(&root_dir, &options.target).context("failed to load root manifest")?;
    info!("root crate: {} {}", manifest.name, manifest.version);

    let lockfile = Lockfile::load(&root_dir).context("failed to load lockfile")?;

    let mut ctx = BuildContext::new(options.target, cache_dir, out_dir, lockfile);
    if let Some(rustc) = options.rustc {
        ctx = ctx.with_rustc(rustc);
    }
    ctx.blacklist.extend(options.blacklist);
    ctx.optionals.extend(options.optionals);

    let root =
        resolver::resolve(&mut ctx, manifest, root_dir).context("dependency resolution failed")?;
    let outcome = builder::build(&mut ctx, &root, "bootstrap").context("build failed")?;

    info!("built {} crates", ctx.built_count());
    Ok(outcome)
}
