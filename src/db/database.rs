// src/db/database.rs

//! File-backed experiment database.
//!
//! Each experiment lives under `<root>/experiments/<name>/`:
//!
//! - `record.json` — the authoritative serialized [`Experiment`]
//! - `status`, `args`, `filename`, `artifacts/<key>` — the logical record
//!   layout, mirrored for external inspection
//! - `stop_requested` — stop side-channel marker (not a status value)
//!
//! Status transitions are atomic with respect to concurrent callers: every
//! mutation takes the experiment's lock, re-reads the current record, and
//! validates the transition against it. A losing racer gets
//! `InvalidTransition` and the state never regresses.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::db::experiment::{Experiment, SubmissionRequest};
use crate::errors::{AtelierError, Result};
use crate::store::transfer::write_file_atomic;
use crate::store::{ArtifactRef, ArtifactStore};
use crate::types::{ExperimentName, Status};

pub struct ExperimentDatabase {
    root: PathBuf,
    locks: Mutex<HashMap<ExperimentName, Arc<Mutex<()>>>>,
}

impl ExperimentDatabase {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("experiments"))
            .with_context(|| format!("creating database root at {root:?}"))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn experiment_dir(&self, name: &str) -> PathBuf {
        self.root.join("experiments").join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.experiment_dir(name).join("record.json")
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a new experiment record with status `waiting`.
    pub fn submit(&self, request: SubmissionRequest) -> Result<Experiment> {
        validate_name(&request.name)?;
        for key in request.artifacts.keys() {
            validate_key(key)?;
        }

        let lock = self.lock_for(&request.name);
        let _guard = hold(&lock);

        if self.record_path(&request.name).exists() {
            return Err(AtelierError::AlreadyExists(request.name));
        }

        let experiment = request.into_experiment();
        self.write_record(&experiment)?;
        info!(
            experiment = %experiment.name,
            filename = %experiment.filename,
            "experiment submitted"
        );
        Ok(experiment)
    }

    pub fn get_experiment(&self, name: &str) -> Result<Experiment> {
        self.read_record(name)
    }

    /// Atomically advance the experiment's status.
    ///
    /// Rejects non-forward transitions with `InvalidTransition`; the caller
    /// observes the winning state on its next read.
    pub fn set_status(&self, name: &str, new_status: Status) -> Result<()> {
        let lock = self.lock_for(name);
        let _guard = hold(&lock);

        let mut experiment = self.read_record(name)?;
        if !experiment.status.can_transition_to(new_status) {
            debug!(
                experiment = %name,
                from = %experiment.status,
                to = %new_status,
                "rejecting status transition"
            );
            return Err(AtelierError::InvalidTransition {
                experiment: name.to_string(),
                from: experiment.status,
                to: new_status,
            });
        }

        let from = experiment.status;
        experiment.status = new_status;
        self.write_record(&experiment)?;
        info!(experiment = %name, from = %from, to = %new_status, "status transition");
        Ok(())
    }

    /// Request a stop via the side-channel marker.
    ///
    /// Idempotent: repeated calls, or calls after the experiment reached a
    /// terminal status, are no-ops.
    pub fn stop_experiment(&self, name: &str) -> Result<()> {
        let lock = self.lock_for(name);
        let _guard = hold(&lock);

        // Read first so a stop on a missing experiment still reports NotFound.
        let experiment = self.read_record(name)?;
        if experiment.status.is_terminal() {
            debug!(experiment = %name, status = %experiment.status, "stop request on terminal experiment; ignoring");
            return Ok(());
        }

        let marker = self.experiment_dir(name).join("stop_requested");
        if !marker.exists() {
            write_file_atomic(&marker, b"")?;
            info!(experiment = %name, "stop requested");
        }
        Ok(())
    }

    /// Side-channel read for workers: has a stop been requested?
    pub fn stop_requested(&self, name: &str) -> bool {
        self.experiment_dir(name).join("stop_requested").exists()
    }

    /// Record an error detail (worker-side failures).
    pub fn set_detail(&self, name: &str, detail: &str) -> Result<()> {
        let lock = self.lock_for(name);
        let _guard = hold(&lock);

        let mut experiment = self.read_record(name)?;
        experiment.detail = Some(detail.to_string());
        self.write_record(&experiment)
    }

    /// Add or update an artifact entry.
    ///
    /// Only legal while the experiment is active; records of terminal
    /// experiments are immutable apart from deletion.
    pub fn put_artifact(&self, name: &str, artifact: ArtifactRef) -> Result<()> {
        validate_key(&artifact.key)?;
        let lock = self.lock_for(name);
        let _guard = hold(&lock);

        let mut experiment = self.read_record(name)?;
        if experiment.status.is_terminal() {
            return Err(AtelierError::Other(anyhow::anyhow!(
                "experiment '{name}' is terminal; artifacts are immutable"
            )));
        }

        experiment
            .artifacts
            .insert(artifact.key.clone(), artifact);
        self.write_record(&experiment)
    }

    /// Delete the record and release all owned artifact payloads.
    ///
    /// Best-effort: a missing experiment is a silent no-op, mirroring
    /// callers that speculatively delete before submission.
    pub fn delete_experiment(&self, name: &str, store: &ArtifactStore) -> Result<()> {
        let lock = self.lock_for(name);
        let _guard = hold(&lock);

        let dir = self.experiment_dir(name);
        if !dir.exists() {
            debug!(experiment = %name, "delete of missing experiment; no-op");
            return Ok(());
        }

        store.release(name)?;
        fs::remove_dir_all(&dir)
            .with_context(|| format!("removing experiment record at {dir:?}"))?;
        info!(experiment = %name, "experiment deleted");
        Ok(())
    }

    /// List experiment names, optionally filtered by prefix.
    ///
    /// Sorted, so the sequence is stable within one call.
    pub fn list_experiments(&self, prefix: Option<&str>) -> Result<Vec<ExperimentName>> {
        let experiments_dir = self.root.join("experiments");
        let mut names = Vec::new();

        for entry in fs::read_dir(&experiments_dir)
            .with_context(|| format!("listing experiments in {experiments_dir:?}"))?
        {
            let entry = entry.map_err(AtelierError::IoError)?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(p) = prefix {
                if !name.starts_with(p) {
                    continue;
                }
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }

    fn read_record(&self, name: &str) -> Result<Experiment> {
        let path = self.record_path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AtelierError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let experiment: Experiment = serde_json::from_str(&contents)
            .with_context(|| format!("parsing experiment record at {path:?}"))?;
        Ok(experiment)
    }

    /// Persist the record and its mirrored logical layout.
    fn write_record(&self, experiment: &Experiment) -> Result<()> {
        let dir = self.experiment_dir(&experiment.name);
        fs::create_dir_all(dir.join("artifacts"))
            .with_context(|| format!("creating experiment directory {dir:?}"))?;

        let json = serde_json::to_vec_pretty(experiment)
            .with_context(|| format!("serializing experiment '{}'", experiment.name))?;
        write_file_atomic(&self.record_path(&experiment.name), &json)?;

        write_file_atomic(&dir.join("status"), experiment.status.as_str().as_bytes())?;
        write_file_atomic(&dir.join("filename"), experiment.filename.as_bytes())?;
        let args = serde_json::to_vec(&experiment.args)
            .with_context(|| format!("serializing args for '{}'", experiment.name))?;
        write_file_atomic(&dir.join("args"), &args)?;
        if let Some(detail) = &experiment.detail {
            write_file_atomic(&dir.join("detail"), detail.as_bytes())?;
        }

        for (key, artifact) in &experiment.artifacts {
            let entry = serde_json::to_vec_pretty(artifact)
                .with_context(|| format!("serializing artifact '{key}'"))?;
            write_file_atomic(&dir.join("artifacts").join(key), &entry)?;
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains(std::path::MAIN_SEPARATOR)
        || name == "."
        || name == ".."
    {
        return Err(AtelierError::ConfigError(format!(
            "invalid experiment name: '{name}'"
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if !crate::store::is_valid_key(key) {
        return Err(AtelierError::ConfigError(format!(
            "invalid artifact key: '{key}'"
        )));
    }
    Ok(())
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}
