// src/config/model.rs

use std::path::PathBuf;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

use crate::errors::AtelierError;

/// Raw config file as deserialized from TOML, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub cloud: CloudSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub run: RunSection,
}

/// Where experiment records live.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    #[serde(default = "default_db_root")]
    pub root: PathBuf,
}

fn default_db_root() -> PathBuf {
    PathBuf::from(".atelier/db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            root: default_db_root(),
        }
    }
}

/// Where artifact payloads live.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".atelier/store")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

/// Cloud object backend settings (`s3://`-style sources).
///
/// The transport is behind the `ObjectStore` trait; this section configures
/// the filesystem-backed implementation (bucket = directory under `root`)
/// and the name of the environment variable holding the access credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudSection {
    /// Root directory mapping bucket names to subdirectories. When unset,
    /// cloud sources are unavailable.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Environment variable consulted for the access credential.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
}

fn default_credential_env() -> String {
    "ATELIER_CLOUD_KEY".to_string()
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            root: None,
            credential_env: default_credential_env(),
        }
    }
}

/// Queue delivery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    /// How long a dequeued `run` message stays leased before it becomes
    /// visible to another worker again.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
}

fn default_lease_timeout_secs() -> u64 {
    30
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            lease_timeout_secs: default_lease_timeout_secs(),
        }
    }
}

/// Run-time knobs for workers and the polling client.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    /// Interval for all polling loops (status waits, stop-marker checks).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for wait-for-completion helpers.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    /// Glob patterns excluded from workspace capture.
    #[serde(default = "default_workspace_exclude")]
    pub workspace_exclude: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_wait_timeout_secs() -> u64 {
    600
}

fn default_workspace_exclude() -> Vec<String> {
    vec![
        "**/*.pyc".to_string(),
        ".atelier/**".to_string(),
        ".git/**".to_string(),
    ]
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_secs: default_wait_timeout_secs(),
            workspace_exclude: default_workspace_exclude(),
        }
    }
}

/// Validated configuration used by the rest of the application.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub store: StoreSection,
    pub cloud: CloudSection,
    pub queue: QueueSection,
    pub run: RunSection,
}

impl ConfigFile {
    /// Compile the workspace exclude patterns into a `GlobSet`.
    pub fn workspace_exclude_globs(&self) -> Result<GlobSet, AtelierError> {
        build_globset(&self.run.workspace_exclude)
    }
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet, AtelierError> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat)
            .map_err(|e| AtelierError::ConfigError(format!("invalid exclude glob '{pat}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| AtelierError::ConfigError(format!("building exclude globset: {e}")))
}

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = AtelierError;

    fn try_from(raw: RawConfigFile) -> Result<Self, Self::Error> {
        if raw.queue.lease_timeout_secs == 0 {
            return Err(AtelierError::ConfigError(
                "queue.lease_timeout_secs must be at least 1".to_string(),
            ));
        }
        if raw.run.poll_interval_ms == 0 {
            return Err(AtelierError::ConfigError(
                "run.poll_interval_ms must be at least 1".to_string(),
            ));
        }

        // Fail early on bad glob syntax rather than at first capture.
        build_globset(&raw.run.workspace_exclude)?;

        Ok(ConfigFile {
            database: raw.database,
            store: raw.store,
            cloud: raw.cloud,
            queue: raw.queue,
            run: raw.run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let raw: RawConfigFile = toml::from_str("").unwrap();
        let cfg = ConfigFile::try_from(raw).unwrap();
        assert_eq!(cfg.database.root, PathBuf::from(".atelier/db"));
        assert_eq!(cfg.queue.lease_timeout_secs, 30);
        assert_eq!(cfg.run.poll_interval_ms, 1000);
        assert!(cfg.cloud.root.is_none());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let raw: RawConfigFile = toml::from_str("[run]\npoll_interval_ms = 0\n").unwrap();
        assert!(ConfigFile::try_from(raw).is_err());
    }

    #[test]
    fn bad_exclude_glob_rejected() {
        let raw: RawConfigFile =
            toml::from_str("[run]\nworkspace_exclude = [\"[unclosed\"]\n").unwrap();
        assert!(ConfigFile::try_from(raw).is_err());
    }
}
