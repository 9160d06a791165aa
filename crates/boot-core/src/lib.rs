//! Core engine for cargo-boot.
//!
//! Bootstraps a Rust crate and its transitive dependencies from a local
//! registry cache without invoking cargo: manifests and the lockfile are
//! parsed directly, version requirements are resolved against the
//! lockfile's pins, crate archives are unpacked on demand, and rustc is
//! driven target by target with full build-script support. Designed for
//! offline and distribution-packaging workflows.

/// Unpacking of `.crate` archives from the local cache.
pub mod archive;
/// Build orchestration: rustc invocation and the build-script protocol.
pub mod builder;
/// The owned context threaded through resolution and building.
pub mod context;
/// Lockfile parsing.
pub mod lockfile;
/// Crate manifest loading and normalization.
pub mod manifest;
/// High-level bootstrap flow.
pub mod ops;
/// Registry index layout and upstream HTTP client.
pub mod registry;
/// Lockfile-guided dependency resolution.
pub mod resolver;
/// Version parsing, ordering, and range algebra.
pub mod semver;

pub use context::{BuildContext, CrateNode};
pub use ops::{BootstrapOptions, bootstrap};

/// User agent sent on every registry request.
pub const USER_AGENT: &str = concat!("cargo-boot/", env!("CARGO_PKG_VERSION"));
