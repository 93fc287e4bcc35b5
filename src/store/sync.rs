// src/store/sync.rs

//! Directory tree reconciliation.
//!
//! `sync_tree` materializes a source tree into a destination directory. With
//! `only_newer`, a destination file whose modification time is at least as
//! new as the source's is left alone; a full sync (only_newer = false)
//! always rewrites, so the destination is byte-for-byte recoverable either
//! way.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Context;
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::Result;

/// What a sync pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub copied: usize,
    pub skipped: usize,
}

/// Reconcile `dest` against `src`.
pub fn sync_tree(src: &Path, dest: &Path, only_newer: bool) -> Result<SyncStats> {
    let mut stats = SyncStats::default();

    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            anyhow::anyhow!("walking source tree {:?}: {e}", src)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| anyhow::anyhow!("stripping prefix from {:?}: {e}", entry.path()))?;
        let target = dest.join(rel);

        if only_newer && is_at_least_as_new(&target, entry.path())? {
            debug!(file = %rel.display(), "sync skip: local copy is at least as new");
            stats.skipped += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating sync directory {parent:?}"))?;
        }
        fs::copy(entry.path(), &target)
            .with_context(|| format!("copying {:?} to {target:?}", entry.path()))?;
        stats.copied += 1;
    }

    debug!(
        src = %src.display(),
        dest = %dest.display(),
        copied = stats.copied,
        skipped = stats.skipped,
        only_newer,
        "tree sync complete"
    );
    Ok(stats)
}

pub(crate) fn is_at_least_as_new(local: &Path, remote: &Path) -> Result<bool> {
    let local_meta = match fs::metadata(local) {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };
    let local_mtime = local_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let remote_mtime = fs::metadata(remote)?
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(local_mtime >= remote_mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn full_sync_copies_everything() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), b"aaa").unwrap();
        fs::write(src.path().join("sub/b.txt"), b"bbb").unwrap();

        let stats = sync_tree(src.path(), dest.path(), false).unwrap();
        assert_eq!(stats.copied, 2);
        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"aaa");
        assert_eq!(fs::read(dest.path().join("sub/b.txt")).unwrap(), b"bbb");
    }

    #[test]
    fn only_newer_skips_fresh_files() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"remote").unwrap();

        // Local copy written after the remote one, so it's at least as new.
        fs::write(dest.path().join("a.txt"), b"local").unwrap();

        let stats = sync_tree(src.path(), dest.path(), true).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"local");

        // Full sync overwrites regardless.
        let stats = sync_tree(src.path(), dest.path(), false).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"remote");
    }
}
