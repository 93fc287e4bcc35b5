// src/store/cloud.rs

//! Cloud object backend abstraction.
//!
//! The store talks to an `ObjectStore` instead of a concrete SDK, so the
//! wire transport stays pluggable and tests can use the filesystem-backed
//! implementation. `FsObjectStore` maps a bucket to a directory under its
//! root; the credential gate still applies so the `AuthError` contract is
//! exercised the same way a real backend would.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::debug;

use crate::errors::{AtelierError, Result};
use crate::store::transfer::write_file_atomic;

/// Credential lookup for cloud access.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    env_var: String,
}

impl EnvCredentials {
    pub fn new(env_var: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
        }
    }

    /// Fails with `Auth` when the credential variable is absent or empty.
    pub fn require(&self) -> Result<String> {
        match std::env::var(&self.env_var) {
            Ok(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(AtelierError::Auth(format!(
                "cloud credentials not found (set {})",
                self.env_var
            ))),
        }
    }
}

/// Trait abstracting object fetches from a cloud store.
pub trait ObjectStore: Send + Sync {
    /// Download `bucket`/`object` into `dest`.
    fn get<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Filesystem-backed object store: `<root>/<bucket>/<object>`.
pub struct FsObjectStore {
    root: PathBuf,
    credentials: EnvCredentials,
}

impl FsObjectStore {
    pub fn new(root: PathBuf, credentials: EnvCredentials) -> Self {
        Self { root, credentials }
    }

    fn object_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(bucket).join(object)
    }
}

impl ObjectStore for FsObjectStore {
    fn get<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.credentials.require()?;

            let src = self.object_path(bucket, object);
            if !src.is_file() {
                return Err(AtelierError::fetch_permanent(
                    format!("s3://{bucket}/{object}"),
                    "object not found",
                ));
            }

            let bytes = std::fs::read(&src)?;
            write_file_atomic(dest, &bytes)?;
            debug!(bucket = %bucket, object = %object, dest = %dest.display(), "cloud object fetched");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credentials_fail_with_auth() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(
            dir.path().to_path_buf(),
            EnvCredentials::new("ATELIER_TEST_MISSING_CRED"),
        );
        let dest = dir.path().join("out.bin");
        let err = store.get("bucket", "key", &dest).await.unwrap_err();
        assert!(matches!(err, AtelierError::Auth(_)), "got: {err}");
    }
}
