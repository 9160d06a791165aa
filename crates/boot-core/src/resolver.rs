//! Lockfile-guided dependency resolution.
//!
//! Starting from the root crate the resolver walks declared dependencies,
//! selects each one's pinned version from the parent's lockfile record,
//! unpacks its sources, and instantiates a [`CrateNode`] in the shared
//! arena. The work queue guarantees every reachable crate is processed
//! exactly once; the lockfile being finite guarantees termination.
//!
//! Dev-dependencies, blacklisted names, and disabled optional dependencies
//! are skipped. Feature sets requested over an edge are the dependency's
//! declared features plus its `default` closure (when default features are
//! on), expanded recursively through the dependency's feature table.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::archive::{self, ArchiveError};
use crate::context::{BuildContext, CrateNode};
use crate::lockfile::LockedDep;
use crate::manifest::{CrateManifest, DepKind, Dependency, ManifestError, expand_features};
use crate::semver::Version;

/// Errors produced during resolution.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No entry in the parent's lockfile record satisfies a declared
    /// requirement.
    #[error("no locked version of `{dependency}` satisfies `{requirement}` (required by {parent})")]
    Unresolved {
        /// The crate declaring the requirement.
        parent: String,
        /// The dependency that could not be pinned.
        dependency: String,
        /// The declared requirement.
        requirement: String,
    },

    /// The lockfile has no record for a crate that was selected.
    #[error("no lockfile record for {name} {version}")]
    MissingLockEntry {
        /// Crate name.
        name: String,
        /// Pinned version with no backing record.
        version: String,
    },

    /// A dependency's sources could not be unpacked.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A dependency's manifest could not be loaded.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Resolve the whole graph reachable from the root crate.
///
/// Seeds the context with a node for `root_manifest` (whose sources live in
/// `root_dir`), then drains the work queue. Returns the root node's arena
/// key.
///
/// # Errors
///
/// Fails when the lockfile lacks a record for the root or for any selected
/// dependency, when no pinned version satisfies a declared requirement, or
/// when sources or manifests cannot be loaded.
pub fn resolve(
    ctx: &mut BuildContext,
    root_manifest: CrateManifest,
    root_dir: PathBuf,
) -> Result<String, ResolveError> {
    let root_nv = root_manifest.namever();
    let version = root_manifest.version.to_string();
    let lock = ctx
        .lock_entry(&root_manifest.name, &version)
        .ok_or_else(|| ResolveError::MissingLockEntry {
            name: root_manifest.name.clone(),
            version,
        })?
        .clone();

    let mut root = CrateNode::new(root_manifest, root_dir, lock);
    root.enabled_features = root.manifest.enabled_features.clone();
    ctx.enqueue(root);

    while let Some(namever) = ctx.next_unresolved() {
        resolve_node(ctx, &namever)?;
    }
    Ok(root_nv)
}

/// Resolve one node: pin, unpack, and record an edge for each of its
/// declared dependencies, enqueueing newly constructed nodes.
fn resolve_node(ctx: &mut BuildContext, namever: &str) -> Result<(), ResolveError> {
    let (deps, lock_deps, parent_features) = {
        let Some(node) = ctx.node(namever) else {
            return Ok(());
        };
        if node.resolved {
            return Ok(());
        }
        (
            node.manifest.dependencies.clone(),
            node.lock.dependencies.clone(),
            node.enabled_features.clone(),
        )
    };

    debug!("resolving dependencies for {namever}");
    let mut edges: Vec<(String, BTreeSet<String>)> = Vec::new();

    for dep in &deps {
        if dep.kind == DepKind::Dev {
            debug!("skipping dev dep {}", dep.name);
            continue;
        }
        if ctx.blacklist.contains(&dep.name) {
            debug!("skipping blacklisted dep {}", dep.name);
            continue;
        }

        let Some(pinned) = select_pinned(dep, &lock_deps) else {
            return Err(ResolveError::Unresolved {
                parent: namever.to_string(),
                dependency: dep.name.clone(),
                requirement: dep.requirement.to_string(),
            });
        };

        let source_dir = match &dep.local_path {
            Some(path) => path.clone(),
            None => archive::unpack_crate(&ctx.cache_dir, &dep.name, &pinned)?,
        };
        let dep_manifest = CrateManifest::load(&source_dir, &ctx.target)?;

        if !is_enabled(dep, &parent_features, ctx) {
            debug!("skipping optional dep {}", dep.name);
            continue;
        }

        let features = edge_features(dep, &dep_manifest);
        debug!("features for {}: {features:?}", dep_manifest.name);

        let dep_nv = format!("{}-{pinned}", dep_manifest.name);
        if !ctx.contains(&dep_nv) {
            let lock = ctx
                .lock_entry(&dep_manifest.name, &pinned)
                .ok_or_else(|| ResolveError::MissingLockEntry {
                    name: dep_manifest.name.clone(),
                    version: pinned.clone(),
                })?
                .clone();
            ctx.enqueue(CrateNode::new(dep_manifest, source_dir, lock));
        }
        edges.push((dep_nv, features));
    }

    for (dep_nv, features) in edges {
        // a dependency compiles with the union of everything requested of it
        if let Some(dep_node) = ctx.node_mut(&dep_nv) {
            dep_node.enabled_features.extend(features.iter().cloned());
        }
        if let Some(node) = ctx.node_mut(namever) {
            node.deps.entry(dep_nv).or_default().extend(features);
        }
    }
    if let Some(node) = ctx.node_mut(namever) {
        node.resolved = true;
    }
    Ok(())
}

/// The first entry in the parent's lockfile record that matches the
/// dependency's name and satisfies its requirement. Lockfile order is
/// authoritative when several entries qualify. Local deps are pinned by
/// location, so any recorded version qualifies.
fn select_pinned(dep: &Dependency, lock_deps: &[LockedDep]) -> Option<String> {
    lock_deps
        .iter()
        .find(|ld| {
            ld.name == dep.name
                && (dep.is_local()
                    || ld
                        .version
                        .parse::<Version>()
                        .is_ok_and(|v| dep.requirement.satisfies(&v)))
        })
        .map(|ld| ld.version.clone())
}

/// Whether an optional dependency is switched on, either from outside the
/// graph (`--enable`) or by a feature of the requesting crate.
fn is_enabled(dep: &Dependency, parent_features: &BTreeSet<String>, ctx: &BuildContext) -> bool {
    !dep.optional || ctx.optionals.contains(&dep.name) || parent_features.contains(&dep.name)
}

/// The feature set requested over an edge: the declared features plus
/// `default` when default features apply, expanded through the
/// dependency's feature table.
fn edge_features(dep: &Dependency, dep_manifest: &CrateManifest) -> BTreeSet<String> {
    let mut seeds: Vec<String> = dep
        .features
        .iter()
        .filter(|f| !f.is_empty())
        .cloned()
        .collect();
    if dep.default_features && dep_manifest.features.contains_key("default") {
        seeds.push("default".to_string());
    }
    expand_features(&dep_manifest.features, seeds)
}
