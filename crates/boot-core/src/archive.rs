//! The local crate archive store.
//!
//! Crate archives are gzip-compressed tarballs named
//! `<name>-<version>.crate`, each containing a single top-level
//! `<name>-<version>/` directory. Unpacking is idempotent: an already
//! unpacked source directory short-circuits the extraction.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::debug;

/// Errors produced by the archive store.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// No `<name>-<version>.crate` file exists in the cache directory.
    #[error("crate archive not found: {0}")]
    Missing(PathBuf),

    /// The archive exists but could not be decoded or extracted.
    #[error("failed to unpack {archive}: {source}")]
    Corrupt {
        /// Path of the offending archive.
        archive: PathBuf,
        /// Underlying decode or I/O error.
        source: std::io::Error,
    },
}

/// Ensure the source tree for `<name>-<version>` exists under `cache_dir`
/// and return its path, unpacking the `.crate` archive on first use.
pub fn unpack_crate(cache_dir: &Path, name: &str, version: &str) -> Result<PathBuf, ArchiveError> {
    let namever = format!("{name}-{version}");
    let source_dir = cache_dir.join(&namever);
    if source_dir.is_dir() {
        return Ok(source_dir);
    }

    let archive = cache_dir.join(format!("{namever}.crate"));
    if !archive.is_file() {
        return Err(ArchiveError::Missing(archive));
    }

    debug!("unpacking {namever}.crate into {}", cache_dir.display());
    let file = File::open(&archive).map_err(|source| ArchiveError::Corrupt {
        archive: archive.clone(),
        source,
    })?;
    let decoder = GzDecoder::new(BufReader::new(file));
    tar::Archive::new(decoder)
        .unpack(cache_dir)
        .map_err(|source| ArchiveError::Corrupt {
            archive: archive.clone(),
            source,
        })?;

    Ok(source_dir)
}
