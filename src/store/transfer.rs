// src/store/transfer.rs

//! The artifact store: content transfer, capture policies and payload
//! ownership.
//!
//! Payload layout: `<root>/<experiment>/<key>/data` (file or directory).
//! Remote-source fetches land in a content cache under `<root>/.cache/`.
//!
//! Writes are atomic from a reader's point of view (staged to a temp path,
//! then renamed); concurrent writes to the same key are serialized through a
//! per-key lock map, while different keys transfer freely in parallel.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use tracing::{debug, info};

use crate::db::ExperimentDatabase;
use crate::errors::{AtelierError, Result};
use crate::store::artifact::{is_valid_key, ArtifactRef, ArtifactSource, CapturePolicy};
use crate::store::cloud::ObjectStore;
use crate::store::http::HttpFetcher;
use crate::store::sync::{is_at_least_as_new, sync_tree, SyncStats};
use crate::store::version::content_version;
use crate::types::{ArtifactKey, ExperimentName};

/// Upper bound on `experiment-alias` resolution depth. Exceeding it is
/// reported as a cycle.
pub const MAX_ALIAS_DEPTH: usize = 8;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` atomically: stage to a temp sibling, then rename.
/// A reader never observes a partially written file.
pub(crate) fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {parent:?}"))?;
    }
    let tmp = temp_sibling(path);
    fs::write(&tmp, bytes).with_context(|| format!("writing staged file {tmp:?}"))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {tmp:?} to {path:?}"))?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string());
    path.with_file_name(format!(".{file_name}.tmp-{}-{n}", std::process::id()))
}

pub struct ArtifactStore {
    root: PathBuf,
    http: HttpFetcher,
    cloud: Option<Box<dyn ObjectStore>>,
    key_locks: Mutex<HashMap<(ExperimentName, ArtifactKey), Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("creating store root at {root:?}"))?;
        Ok(Self {
            root,
            http: HttpFetcher::default(),
            cloud: None,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a cloud object backend for `s3://` sources.
    pub fn with_cloud(mut self, backend: Box<dyn ObjectStore>) -> Self {
        self.cloud = Some(backend);
        self
    }

    /// Attach a custom HTTP fetcher (tests tune the retry budget).
    pub fn with_http(mut self, http: HttpFetcher) -> Self {
        self.http = http;
        self
    }

    /// Path of the payload for `owner`/`key`. May be a file or a directory.
    pub fn payload_path(&self, owner: &str, key: &str) -> PathBuf {
        self.root.join(owner).join(key).join("data")
    }

    fn cache_path(&self, source: &str) -> PathBuf {
        let digest = blake3::hash(source.as_bytes()).to_hex().to_string();
        self.root.join(".cache").join(digest)
    }

    fn key_lock(&self, owner: &str, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((owner.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Materialize the content behind `artifact` and return a local path.
    ///
    /// Published refs resolve to the store payload (digest-verified);
    /// unpublished refs resolve their source. Aliases recurse with a depth
    /// bound.
    pub async fn fetch(
        &self,
        db: &ExperimentDatabase,
        owner: &str,
        artifact: &ArtifactRef,
    ) -> Result<PathBuf> {
        self.fetch_at_depth(db, owner, artifact, 0).await
    }

    async fn fetch_at_depth(
        &self,
        db: &ExperimentDatabase,
        owner: &str,
        artifact: &ArtifactRef,
        depth: usize,
    ) -> Result<PathBuf> {
        if depth > MAX_ALIAS_DEPTH {
            return Err(AtelierError::Cycle(format!(
                "{owner}/{} (depth > {MAX_ALIAS_DEPTH})",
                artifact.key
            )));
        }

        if let ArtifactSource::ExperimentAlias { experiment, key } = &artifact.source {
            let target_exp = db.get_experiment(experiment)?;
            let target = target_exp.artifacts.get(key).ok_or_else(|| {
                AtelierError::NotFound(format!("artifact {experiment}/{key}"))
            })?;
            debug!(
                owner = %owner,
                key = %artifact.key,
                target = %format!("{experiment}/{key}"),
                depth,
                "resolving artifact alias"
            );
            return Box::pin(self.fetch_at_depth(db, experiment, target, depth + 1)).await;
        }

        if let Some(expected) = &artifact.remote_version {
            let path = self.payload_path(owner, &artifact.key);
            if !path.exists() {
                return Err(AtelierError::fetch_permanent(
                    format!("{owner}/{}", artifact.key),
                    "published payload missing from store",
                ));
            }
            let actual = content_version(&path)?;
            if &actual != expected {
                return Err(AtelierError::Integrity {
                    what: format!("{owner}/{}", artifact.key),
                    expected: expected.clone(),
                    actual,
                });
            }
            return Ok(path);
        }

        match &artifact.source {
            ArtifactSource::LocalPath { path } => {
                if !path.exists() {
                    return Err(AtelierError::fetch_permanent(
                        path.display().to_string(),
                        "local path does not exist",
                    ));
                }
                Ok(path.clone())
            }
            ArtifactSource::RemoteUrl { url } => {
                let dest = self.cache_path(url);
                self.http.fetch_to(url, &dest).await?;
                Ok(dest)
            }
            ArtifactSource::CloudUri { bucket, object } => {
                let backend = self.cloud.as_ref().ok_or_else(|| {
                    AtelierError::fetch_permanent(
                        format!("s3://{bucket}/{object}"),
                        "no cloud backend configured",
                    )
                })?;
                let dest = self.cache_path(&format!("s3://{bucket}/{object}"));
                backend.get(bucket, object, &dest).await?;
                Ok(dest)
            }
            ArtifactSource::ExperimentAlias { .. } => unreachable!("alias handled above"),
        }
    }

    /// Publish local content into the store under `owner`, applying the
    /// ref's capture policy. Returns the updated ref (the caller records it
    /// in the database).
    pub async fn publish(
        &self,
        local: &Path,
        owner: &str,
        artifact: &ArtifactRef,
    ) -> Result<ArtifactRef> {
        // Keys become payload directory names; a traversal key would land
        // bytes outside the store root where `release` cannot reach them.
        if !is_valid_key(&artifact.key) {
            return Err(AtelierError::ConfigError(format!(
                "invalid artifact key: '{}'",
                artifact.key
            )));
        }

        if artifact.policy == CapturePolicy::Reuse {
            // Zero-copy: the ref stays an alias, nothing is uploaded.
            debug!(owner = %owner, key = %artifact.key, "reuse policy; skipping upload");
            return Ok(artifact.clone());
        }

        // Cheap version signal computed before any byte transfer.
        let version = content_version(local)?;

        if artifact.policy == CapturePolicy::CaptureOnce
            && artifact.remote_version.as_deref() == Some(version.as_str())
        {
            info!(
                owner = %owner,
                key = %artifact.key,
                version = %version,
                "capture-once: content unchanged; skipping transfer"
            );
            return Ok(artifact.clone());
        }

        let lock = self.key_lock(owner, &artifact.key);
        {
            let _guard = hold(&lock);
            self.store_payload(local, owner, &artifact.key)?;
        }

        let mut updated = artifact.clone();
        updated.remote_version = Some(version.clone());
        info!(
            owner = %owner,
            key = %artifact.key,
            version = %version,
            "artifact published"
        );
        Ok(updated)
    }

    /// Copy the resolved content of `owner`/`key` to `dest`.
    pub async fn download(
        &self,
        db: &ExperimentDatabase,
        owner: &str,
        key: &str,
        dest: &Path,
    ) -> Result<()> {
        let experiment = db.get_experiment(owner)?;
        let artifact = experiment
            .artifacts
            .get(key)
            .ok_or_else(|| AtelierError::NotFound(format!("artifact {owner}/{key}")))?;

        let src = self.fetch(db, owner, artifact).await?;
        if src.is_dir() {
            sync_tree(&src, dest, false)?;
        } else {
            let bytes = fs::read(&src)?;
            write_file_atomic(dest, &bytes)?;
        }
        Ok(())
    }

    /// Reconcile `local_dir` against the stored tree of `owner`/`key`.
    ///
    /// With `only_newer`, local files at least as new as the stored copy are
    /// not re-fetched. A full sync recovers every file byte-for-byte.
    pub async fn sync(
        &self,
        db: &ExperimentDatabase,
        owner: &str,
        key: &str,
        local_dir: &Path,
        only_newer: bool,
    ) -> Result<SyncStats> {
        let experiment = db.get_experiment(owner)?;
        let artifact = experiment
            .artifacts
            .get(key)
            .ok_or_else(|| AtelierError::NotFound(format!("artifact {owner}/{key}")))?;

        let src = self.fetch(db, owner, artifact).await?;
        if src.is_dir() {
            sync_tree(&src, local_dir, only_newer)
        } else {
            // Single-file artifact: place it under its key name.
            let target = local_dir.join(&artifact.key);
            if only_newer && is_at_least_as_new(&target, &src)? {
                return Ok(SyncStats {
                    copied: 0,
                    skipped: 1,
                });
            }
            fs::create_dir_all(local_dir)
                .with_context(|| format!("creating sync directory {local_dir:?}"))?;
            let bytes = fs::read(&src)?;
            write_file_atomic(&target, &bytes)?;
            Ok(SyncStats {
                copied: 1,
                skipped: 0,
            })
        }
    }

    /// Release every payload owned by `owner`. Missing payloads are fine.
    pub fn release(&self, owner: &str) -> Result<()> {
        let dir = self.root.join(owner);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("releasing artifacts under {dir:?}"))?;
            info!(experiment = %owner, "artifact payloads released");
        }
        Ok(())
    }

    /// Stage + rename so readers only ever see the old or the new payload.
    fn store_payload(&self, local: &Path, owner: &str, key: &str) -> Result<()> {
        let dest = self.payload_path(owner, key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating payload directory {parent:?}"))?;
        }

        if local.is_dir() {
            let staged = temp_sibling(&dest);
            copy_tree(local, &staged)?;
            if dest.exists() {
                fs::remove_dir_all(&dest)
                    .with_context(|| format!("removing previous payload {dest:?}"))?;
            }
            fs::rename(&staged, &dest)
                .with_context(|| format!("renaming staged payload to {dest:?}"))?;
        } else {
            let bytes = fs::read(local).with_context(|| format!("reading {local:?}"))?;
            if dest.is_dir() {
                fs::remove_dir_all(&dest)
                    .with_context(|| format!("removing previous payload {dest:?}"))?;
            }
            write_file_atomic(&dest, &bytes)?;
        }
        Ok(())
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    sync_tree(src, dest, false)?;
    Ok(())
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        write_file_atomic(&path, b"one").unwrap();
        write_file_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // No staged leftovers.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn cache_paths_are_stable_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let a = store.cache_path("https://example.com/a");
        let b = store.cache_path("https://example.com/a");
        let c = store.cache_path("https://example.com/b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
