// src/errors.rs

//! Crate-wide error taxonomy and `Result` alias.

use thiserror::Error;

use crate::types::Status;

#[derive(Error, Debug)]
pub enum AtelierError {
    #[error("Experiment not found: {0}")]
    NotFound(String),

    #[error("Experiment already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid status transition for '{experiment}': {from} -> {to}")]
    InvalidTransition {
        experiment: String,
        from: Status,
        to: Status,
    },

    /// Transfer failure. `transient` failures were already retried with
    /// backoff before this error surfaced.
    #[error("Fetch failed for {what}: {reason}")]
    Fetch {
        what: String,
        reason: String,
        transient: bool,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Artifact alias resolution exceeded depth limit: {0}")]
    Cycle(String),

    #[error("Content integrity mismatch for {what}: expected {expected}, got {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AtelierError {
    /// Permanent fetch failure (bad URL, 404, missing object).
    pub fn fetch_permanent(what: impl Into<String>, reason: impl Into<String>) -> Self {
        AtelierError::Fetch {
            what: what.into(),
            reason: reason.into(),
            transient: false,
        }
    }

    /// Transient fetch failure that exhausted its retry budget.
    pub fn fetch_transient(what: impl Into<String>, reason: impl Into<String>) -> Self {
        AtelierError::Fetch {
            what: what.into(),
            reason: reason.into(),
            transient: true,
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, AtelierError>;
