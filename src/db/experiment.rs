// src/db/experiment.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provenance::GitInfo;
use crate::store::ArtifactRef;
use crate::types::{ArtifactKey, ExperimentName, Status};

/// One submitted unit of work, tracked from submission to completion.
///
/// `name`, `filename` and `args` are immutable once set. `artifacts` only
/// ever grows while the experiment is active; entries are removed only as
/// part of whole-experiment deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: ExperimentName,
    pub status: Status,
    /// Submitted script name.
    pub filename: String,
    /// Submitted argument strings, in order.
    pub args: Vec<String>,
    /// Hyperparameter overrides, exposed to the job as environment variables.
    #[serde(default)]
    pub hyperparams: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactKey, ArtifactRef>,
    /// Git provenance of the submitting workspace, when available.
    #[serde(default)]
    pub provenance: Option<GitInfo>,
    /// Error detail recorded by the worker on failure.
    #[serde(default)]
    pub detail: Option<String>,
}

/// Everything the orchestrator client supplies at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub name: ExperimentName,
    pub filename: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub hyperparams: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactKey, ArtifactRef>,
    #[serde(default)]
    pub provenance: Option<GitInfo>,
}

impl SubmissionRequest {
    pub fn into_experiment(self) -> Experiment {
        Experiment {
            name: self.name,
            status: Status::Waiting,
            filename: self.filename,
            args: self.args,
            hyperparams: self.hyperparams,
            artifacts: self.artifacts,
            provenance: self.provenance,
            detail: None,
        }
    }
}
