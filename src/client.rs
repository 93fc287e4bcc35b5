// src/client.rs

//! Orchestrator client: submits jobs, polls status, downloads artifacts.
//!
//! There is no push/subscribe primitive on the database, so all waits are
//! bounded fixed-interval polling loops; callers observe status eventually
//! rather than immediately.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::db::{Experiment, ExperimentDatabase, SubmissionRequest};
use crate::errors::{AtelierError, Result};
use crate::queue::{LocalQueue, QueueMessage, RunPayload};
use crate::store::sync::SyncStats;
use crate::store::ArtifactStore;
use crate::types::{ExperimentName, Status};
use crate::worker::WORKSPACE_KEY;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Fixed interval of status polling loops.
    pub poll_interval: Duration,
    /// Upper bound for wait helpers; exceeding it is an error, not a hang.
    pub wait_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(600),
        }
    }
}

pub struct Client {
    db: Arc<ExperimentDatabase>,
    store: Arc<ArtifactStore>,
    queue: LocalQueue,
    options: ClientOptions,
}

impl Client {
    pub fn new(
        db: Arc<ExperimentDatabase>,
        store: Arc<ArtifactStore>,
        queue: LocalQueue,
        options: ClientOptions,
    ) -> Self {
        Self {
            db,
            store,
            queue,
            options,
        }
    }

    /// Submit an experiment: record it as `waiting`, then enqueue the run
    /// request. A queue failure here is fatal to the submission.
    pub fn submit(&self, request: SubmissionRequest, workspace: &Path) -> Result<Experiment> {
        let experiment = self.db.submit(request)?;

        let payload = RunPayload {
            experiment: experiment.name.clone(),
            filename: experiment.filename.clone(),
            args: experiment.args.clone(),
            hyperparams: experiment.hyperparams.clone(),
            artifacts: experiment.artifacts.clone(),
            workspace: workspace.to_path_buf(),
        };
        self.queue.enqueue(QueueMessage::run(payload))?;
        info!(experiment = %experiment.name, "experiment enqueued");
        Ok(experiment)
    }

    /// Poll until the experiment satisfies `pred`, within the configured
    /// timeout. `NotFound` is tolerated while the record is appearing.
    pub async fn wait_for_status(
        &self,
        name: &str,
        pred: impl Fn(Status) -> bool,
    ) -> Result<Experiment> {
        let deadline = Instant::now() + self.options.wait_timeout;

        loop {
            match self.db.get_experiment(name) {
                Ok(experiment) if pred(experiment.status) => return Ok(experiment),
                Ok(experiment) => {
                    debug!(experiment = %name, status = %experiment.status, "still waiting");
                }
                Err(AtelierError::NotFound(_)) => {
                    debug!(experiment = %name, "record not visible yet");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(AtelierError::Other(anyhow::anyhow!(
                    "timed out waiting for experiment '{name}' after {:?}",
                    self.options.wait_timeout
                )));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Wait until the experiment reaches any terminal status.
    pub async fn wait_until_terminal(&self, name: &str) -> Result<Experiment> {
        self.wait_for_status(name, |s| s.is_terminal()).await
    }

    /// Copy the resolved content of an artifact to `dest`.
    pub async fn download_artifact(&self, name: &str, key: &str, dest: &Path) -> Result<()> {
        self.store.download(&self.db, name, key, dest).await
    }

    /// Reconcile `local_dir` against the experiment's captured workspace.
    pub async fn sync_workspace(
        &self,
        name: &str,
        local_dir: &Path,
        only_newer: bool,
    ) -> Result<SyncStats> {
        self.store
            .sync(&self.db, name, WORKSPACE_KEY, local_dir, only_newer)
            .await
    }

    /// Request a stop: mark the database side channel and publish on the
    /// queue's stop topic. Idempotent.
    pub fn stop(&self, name: &str) -> Result<()> {
        self.db.stop_experiment(name)?;
        self.queue.send_stop(name);
        Ok(())
    }

    /// Delete the experiment and release its artifacts. Silent no-op when
    /// the experiment does not exist.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.db.delete_experiment(name, &self.store)
    }

    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<ExperimentName>> {
        self.db.list_experiments(prefix)
    }

    pub fn database(&self) -> &Arc<ExperimentDatabase> {
        &self.db
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }
}
