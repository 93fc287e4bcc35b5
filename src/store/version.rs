// src/store/version.rs

//! Content versioning for artifacts.
//!
//! A version token is the blake3 hex digest of the artifact content. For
//! directory artifacts the digest covers every file's relative path and
//! content, with paths sorted so the token is stable regardless of walk
//! order. Computing the token reads only local bytes, so `capture-once` can
//! compare versions before any remote transfer happens.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use blake3::Hasher;
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::Result;

/// Compute the version token of a single file.
pub fn file_version(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    hash_file_into(&mut hasher, path)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute the version token of a directory tree.
///
/// Covers relative paths and file contents; empty directories do not affect
/// the token.
pub fn tree_version(root: &Path) -> Result<String> {
    let mut entries: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    entries.sort();

    let mut hasher = Hasher::new();
    for path in entries {
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        hash_file_into(&mut hasher, &path)?;
    }

    let version = hasher.finalize().to_hex().to_string();
    debug!(root = %root.display(), version = %version, "computed tree version");
    Ok(version)
}

/// Version token for either a file or a directory.
pub fn content_version(path: &Path) -> Result<String> {
    if path.is_dir() {
        tree_version(path)
    } else {
        file_version(path)
    }
}

fn hash_file_into(hasher: &mut Hasher, path: &Path) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("opening file for versioning: {path:?}"))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}
