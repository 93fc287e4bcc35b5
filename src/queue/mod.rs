// src/queue/mod.rs

//! Run-request delivery.
//!
//! The queue conveys `run` messages to exactly one worker at a time under a
//! lease: a dequeued message that is never acknowledged becomes visible
//! again after the lease timeout (at-least-once delivery, so workers treat
//! duplicate runs as safe). `stop` requests travel out-of-band on a
//! per-experiment side topic, never behind the main backlog.
//!
//! Queues are explicitly constructed and passed around; there is no shared
//! default instance, and [`LocalQueue::clean`] resets one for test
//! isolation.

pub mod local;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::store::ArtifactRef;
use crate::types::{ArtifactKey, ExperimentName};

pub use local::{LeasedMessage, LocalQueue};

/// Full submission payload carried by a `run` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub experiment: ExperimentName,
    pub filename: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub hyperparams: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactKey, ArtifactRef>,
    /// Directory the job executes in (the submitted workspace).
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueCommand {
    Run(Box<RunPayload>),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub experiment: ExperimentName,
    pub command: QueueCommand,
}

impl QueueMessage {
    pub fn run(payload: RunPayload) -> Self {
        Self {
            experiment: payload.experiment.clone(),
            command: QueueCommand::Run(Box::new(payload)),
        }
    }

    pub fn stop(experiment: impl Into<ExperimentName>) -> Self {
        Self {
            experiment: experiment.into(),
            command: QueueCommand::Stop,
        }
    }
}
