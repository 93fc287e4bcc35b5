// src/store/artifact.rs

//! Artifact descriptor types.
//!
//! An [`ArtifactRef`] is data only: it names an artifact within its owning
//! experiment, says where its content comes from, and which capture policy
//! applies when the worker publishes it. Payload bytes are owned by the
//! [`super::ArtifactStore`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{ArtifactKey, ExperimentName};

/// Whether `key` is usable as an artifact name: a single path component,
/// no separators, no traversal.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.contains('/')
        && !key.contains(std::path::MAIN_SEPARATOR)
        && key != "."
        && key != ".."
}

/// Where an artifact's content originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ArtifactSource {
    /// A path on the submitting machine. No transfer on fetch.
    LocalPath { path: PathBuf },
    /// An `http://` or `https://` URL.
    RemoteUrl { url: String },
    /// An `s3://bucket/key`-style object URI.
    CloudUri { bucket: String, object: String },
    /// Another experiment's artifact, resolved transitively at fetch time.
    ExperimentAlias {
        experiment: ExperimentName,
        key: ArtifactKey,
    },
}

impl ArtifactSource {
    /// Parse the `<source>` syntax accepted on the CLI: an `http(s)://` URL,
    /// an `s3://bucket/key` URI, or anything else as a filesystem path.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(ArtifactSource::RemoteUrl { url: s.to_string() });
        }
        if let Some(rest) = s.strip_prefix("s3://") {
            let (bucket, object) = rest
                .split_once('/')
                .ok_or_else(|| format!("cloud URI missing object key: {s}"))?;
            if bucket.is_empty() || object.is_empty() {
                return Err(format!("cloud URI missing bucket or object key: {s}"));
            }
            return Ok(ArtifactSource::CloudUri {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        if s.is_empty() {
            return Err("empty artifact source".to_string());
        }
        Ok(ArtifactSource::LocalPath {
            path: PathBuf::from(s),
        })
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSource::LocalPath { path } => write!(f, "{}", path.display()),
            ArtifactSource::RemoteUrl { url } => f.write_str(url),
            ArtifactSource::CloudUri { bucket, object } => write!(f, "s3://{bucket}/{object}"),
            ArtifactSource::ExperimentAlias { experiment, key } => {
                write!(f, "{experiment}/{key}")
            }
        }
    }
}

/// What the worker does with an artifact when the job completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapturePolicy {
    /// Upload unconditionally on every run.
    AlwaysCapture,
    /// Upload only when the content differs from the last published version.
    CaptureOnce,
    /// Never upload; the ref stays an alias to another experiment's artifact.
    Reuse,
}

/// Non-owning descriptor of a named artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: ArtifactKey,
    pub source: ArtifactSource,
    pub policy: CapturePolicy,
    /// Opaque version token of the last published content (blake3 hex
    /// digest). `None` until the first successful publish. Under
    /// `capture-once` this changes at most once per distinct content.
    #[serde(default)]
    pub remote_version: Option<String>,
}

impl ArtifactRef {
    pub fn new(key: impl Into<ArtifactKey>, source: ArtifactSource, policy: CapturePolicy) -> Self {
        Self {
            key: key.into(),
            source,
            policy,
            remote_version: None,
        }
    }

    /// A `reuse` alias pointing at `experiment`'s artifact `key`.
    pub fn alias(
        local_key: impl Into<ArtifactKey>,
        experiment: impl Into<ExperimentName>,
        key: impl Into<ArtifactKey>,
    ) -> Self {
        Self {
            key: local_key.into(),
            source: ArtifactSource::ExperimentAlias {
                experiment: experiment.into(),
                key: key.into(),
            },
            policy: CapturePolicy::Reuse,
            remote_version: None,
        }
    }

    /// Whether this ref has published payload bytes in the store.
    pub fn is_published(&self) -> bool {
        self.remote_version.is_some()
    }
}
