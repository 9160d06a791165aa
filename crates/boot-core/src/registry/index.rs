//! Local registry index maintenance.
//!
//! The index is a filesystem hierarchy of line-oriented JSON files, one file
//! per crate and one line per published version. Files fan out by name
//! length: `1/a`, `2/ab`, `3/a/abc`, and `ab/cd/abcdefg` for longer names.
//! Updates rewrite the whole file, replacing the line whose `vers` field
//! matches or appending when absent.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

/// Errors produced by index maintenance.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The index file could not be read or written.
    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An existing index line is not valid JSON.
    #[error("malformed index line: {0}")]
    Json(#[from] serde_json::Error),
}

/// Relative location of a crate's index file under the index root.
pub fn index_rel(name: &str) -> String {
    match name.len() {
        1 => format!("1/{name}"),
        2 => format!("2/{name}"),
        3 => format!("3/{}/{name}", &name[0..1]),
        _ => format!("{}/{}/{name}", &name[0..2], &name[2..4]),
    }
}

/// The index file path for `name` under the index root.
pub fn index_path(root: &Path, name: &str) -> PathBuf {
    root.join(index_rel(name))
}

/// Publish or republish a version: replace the line whose `vers` equals
/// `version`, append when no line matches, create the file on first publish.
pub fn update(index_file: &Path, version: &str, entry: &str) -> Result<(), IndexError> {
    if !index_file.is_file() {
        if let Some(parent) = index_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(index_file, format!("{entry}\n"))?;
        return Ok(());
    }

    let mut lines = Vec::new();
    let mut found = false;
    for line in fs::read_to_string(index_file)?.lines() {
        let parsed: Value = serde_json::from_str(line)?;
        if parsed.get("vers").and_then(Value::as_str) == Some(version) {
            lines.push(entry.to_string());
            found = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !found {
        lines.push(entry.to_string());
    }
    fs::write(index_file, format!("{}\n", lines.join("\n")))?;
    Ok(())
}

/// Yank a version: drop the matching line. The file is left untouched when
/// nothing matches, and absent files are not created.
pub fn remove(index_file: &Path, version: &str) -> Result<(), IndexError> {
    if !index_file.is_file() {
        return Ok(());
    }

    let mut lines = Vec::new();
    let mut found = false;
    for line in fs::read_to_string(index_file)?.lines() {
        let parsed: Value = serde_json::from_str(line)?;
        if parsed.get("vers").and_then(Value::as_str) == Some(version) {
            found = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if found {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(index_file, content)?;
    }
    Ok(())
}
