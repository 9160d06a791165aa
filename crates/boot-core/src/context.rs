//! The shared build context.
//!
//! One [`BuildContext`] owns everything a bootstrap run mutates: the crate
//! node arena, the lockfile pins, the work queue, and the memoized build
//! results. It is threaded by reference through the resolver and builder;
//! nothing in the engine is global. Dependency edges between nodes are
//! `namever` keys into the arena, never owning pointers, so the node graph
//! stays acyclic in ownership terms even when the logical graph shares nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use crate::builder::BuildOutcome;
use crate::lockfile::{LockEntry, Lockfile};
use crate::manifest::CrateManifest;

/// A crate instantiated by the resolver, keyed by `<name>-<version>`.
#[derive(Debug)]
pub struct CrateNode {
    /// The crate's normalized manifest.
    pub manifest: CrateManifest,
    /// Directory holding the crate's sources.
    pub source_dir: PathBuf,
    /// The lockfile record pinning this crate.
    pub lock: LockEntry,
    /// Resolved dependency edges: arena key to the feature set requested
    /// over that edge.
    pub deps: BTreeMap<String, BTreeSet<String>>,
    /// Features this crate is compiled with. Seeded from the manifest for
    /// the root crate; for dependencies, the union of incoming edges.
    pub enabled_features: BTreeSet<String>,
    /// Whether the resolver has processed this node.
    pub resolved: bool,
}

impl CrateNode {
    /// Create an unresolved node.
    pub fn new(manifest: CrateManifest, source_dir: PathBuf, lock: LockEntry) -> Self {
        Self {
            manifest,
            source_dir,
            lock,
            deps: BTreeMap::new(),
            enabled_features: BTreeSet::new(),
            resolved: false,
        }
    }

    /// `<name>-<version>`, the node's arena key.
    pub fn namever(&self) -> String {
        self.manifest.namever()
    }
}

/// All state shared across one bootstrap invocation.
#[derive(Debug)]
pub struct BuildContext {
    /// Target triple passed to every compile.
    pub target: String,
    /// Host triple exported to build scripts.
    pub host: String,
    /// Directory of downloaded `.crate` archives and unpacked sources.
    pub cache_dir: PathBuf,
    /// Directory receiving every build artifact.
    pub out_dir: PathBuf,
    /// The compiler driver. Defaults to `rustc`; overridable for tests and
    /// alternative toolchains.
    pub rustc: PathBuf,
    /// Dependency names the resolver skips outright.
    pub blacklist: BTreeSet<String>,
    /// Optional dependencies enabled from outside the crate graph.
    pub optionals: BTreeSet<String>,

    lock: Lockfile,
    crates: HashMap<String, CrateNode>,
    queue: VecDeque<String>,
    built: HashMap<String, BuildOutcome>,
}

impl BuildContext {
    /// Create a context for one bootstrap run. The host triple mirrors the
    /// target triple; cross-compilation support stops at passing the triple
    /// through.
    pub fn new(
        target: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        lock: Lockfile,
    ) -> Self {
        let target = target.into();
        Self {
            host: target.clone(),
            target,
            cache_dir: cache_dir.into(),
            out_dir: out_dir.into(),
            rustc: PathBuf::from("rustc"),
            blacklist: BTreeSet::new(),
            optionals: BTreeSet::new(),
            lock,
            crates: HashMap::new(),
            queue: VecDeque::new(),
            built: HashMap::new(),
        }
    }

    /// Use a different compiler driver.
    pub fn with_rustc(mut self, rustc: impl Into<PathBuf>) -> Self {
        self.rustc = rustc.into();
        self
    }

    /// The root crate's lockfile record.
    pub fn root_lock(&self) -> &LockEntry {
        &self.lock.root
    }

    /// The lockfile record pinning `name` at `version`, if any.
    pub fn lock_entry(&self, name: &str, version: &str) -> Option<&LockEntry> {
        self.lock.find(name, version)
    }

    /// A resolved node by arena key.
    pub fn node(&self, namever: &str) -> Option<&CrateNode> {
        self.crates.get(namever)
    }

    /// A resolved node by arena key, mutably.
    pub fn node_mut(&mut self, namever: &str) -> Option<&mut CrateNode> {
        self.crates.get_mut(namever)
    }

    /// Whether a node exists for the key.
    pub fn contains(&self, namever: &str) -> bool {
        self.crates.contains_key(namever)
    }

    /// Insert a node and enqueue it for resolution.
    pub fn enqueue(&mut self, node: CrateNode) {
        let key = node.namever();
        self.crates.insert(key.clone(), node);
        self.queue.push_back(key);
    }

    /// Pop the next node awaiting resolution.
    pub fn next_unresolved(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    /// Iterate all instantiated nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &CrateNode> {
        self.crates.values()
    }

    /// The memoized result of building `namever`, if it has been built.
    pub fn built(&self, namever: &str) -> Option<&BuildOutcome> {
        self.built.get(namever)
    }

    /// Memoize a build result.
    pub fn mark_built(&mut self, namever: String, outcome: BuildOutcome) {
        self.built.insert(namever, outcome);
    }

    /// Number of crates built so far.
    pub fn built_count(&self) -> usize {
        self.built.len()
    }
}
