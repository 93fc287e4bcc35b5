// src/worker/mod.rs

//! Worker: consumes run requests and drives each claimed job through
//! `claimed -> preparing -> executing -> capturing -> reporting`.
//!
//! Failures in preparing or executing record an error detail and the job
//! still goes through capturing and reporting best-effort, so partial
//! output (e.g. the log) stays inspectable. A stop observed while executing
//! kills the job and reports `stopped`, never `failed`. Duplicate `run`
//! delivery is safe: the worker re-checks the experiment status before
//! claiming.

pub mod backend;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use globset::GlobSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::ExperimentDatabase;
use crate::errors::{AtelierError, Result};
use crate::queue::{LeasedMessage, LocalQueue, QueueCommand, RunPayload};
use crate::store::artifact::{ArtifactRef, ArtifactSource, CapturePolicy};
use crate::store::sync::sync_tree;
use crate::store::transfer::write_file_atomic;
use crate::store::ArtifactStore;
use crate::types::{JobOutcome, Status};

pub use backend::{JobBackend, JobSpec, ProcessJobBackend};

/// Reserved artifact key for the captured workspace tree.
pub const WORKSPACE_KEY: &str = "workspace";
/// Reserved artifact key for the captured job output log.
pub const OUTPUT_KEY: &str = "output";
/// Location of the job output log inside the workspace (excluded from
/// workspace capture by the default excludes).
pub const OUTPUT_LOG_RELPATH: &str = ".atelier/output.log";

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Interval of the worker's own stop-marker polling.
    pub poll_interval: Duration,
    /// Globs excluded from workspace capture.
    pub workspace_exclude: GlobSet,
}

pub struct Worker<B: JobBackend> {
    db: Arc<ExperimentDatabase>,
    store: Arc<ArtifactStore>,
    queue: LocalQueue,
    backend: B,
    options: WorkerOptions,
}

impl<B: JobBackend> Worker<B> {
    pub fn new(
        db: Arc<ExperimentDatabase>,
        store: Arc<ArtifactStore>,
        queue: LocalQueue,
        backend: B,
        options: WorkerOptions,
    ) -> Self {
        Self {
            db,
            store,
            queue,
            backend,
            options,
        }
    }

    /// Consume messages forever. Job failures are recorded into the
    /// experiment, and a message whose processing itself errors is left for
    /// redelivery; neither ends the loop.
    pub async fn run(&mut self) -> Result<()> {
        info!("worker started");
        loop {
            if let Err(e) = self.run_one().await {
                warn!(error = %e, "message processing failed");
            }
        }
    }

    /// Consume and process exactly one queue message.
    ///
    /// The lease is retired only after processing succeeds (the run's
    /// outcome lives in the experiment record). On a processing error the
    /// lease is left to expire, so the message is redelivered.
    pub async fn run_one(&mut self) -> Result<()> {
        let leased = self.queue.dequeue().await;
        match self.process(&leased).await {
            Ok(()) => {
                if let Err(e) = self.queue.acknowledge(&leased) {
                    warn!(experiment = %leased.message.experiment, error = %e, "acknowledge failed");
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    experiment = %leased.message.experiment,
                    error = %e,
                    "processing failed; leaving lease to expire"
                );
                Err(e)
            }
        }
    }

    async fn process(&mut self, leased: &LeasedMessage) -> Result<()> {
        match &leased.message.command {
            QueueCommand::Stop => {
                // Stops normally travel on the side topic; tolerate one in
                // the main queue by forwarding to the database marker.
                warn!(experiment = %leased.message.experiment, "stop message on main queue");
                match self.db.stop_experiment(&leased.message.experiment) {
                    Ok(()) | Err(AtelierError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            QueueCommand::Run(payload) => self.run_job(payload).await,
        }
    }

    async fn run_job(&mut self, payload: &RunPayload) -> Result<()> {
        let name = payload.experiment.clone();

        // Claim. At-least-once delivery means duplicates are expected; only
        // a `waiting` experiment may be claimed.
        let experiment = match self.db.get_experiment(&name) {
            Ok(e) => e,
            Err(AtelierError::NotFound(_)) => {
                info!(experiment = %name, "run message for deleted experiment; skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if experiment.status != Status::Waiting {
            info!(
                experiment = %name,
                status = %experiment.status,
                "duplicate run delivery; experiment already claimed"
            );
            return Ok(());
        }
        match self.db.set_status(&name, Status::Running) {
            Ok(()) => {}
            Err(AtelierError::InvalidTransition { .. }) => {
                // Another worker won the claim race.
                info!(experiment = %name, "lost claim race; skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // Merge the queue stop topic and the database stop marker into one
        // channel the backend can select on.
        let (stop_tx, stop_rx) = watch::channel(false);
        let forwarder = spawn_stop_forwarder(
            Arc::clone(&self.db),
            self.queue.clone(),
            name.clone(),
            stop_tx,
            self.options.poll_interval,
        );

        let mut failure: Option<String> = None;
        let artifacts = payload.artifacts.clone();

        // Preparing: materialize input artifacts into the workspace.
        if let Err(e) = self.prepare(payload, &artifacts).await {
            warn!(experiment = %name, error = %e, "prepare phase failed");
            failure = Some(format!("prepare failed: {e}"));
        }

        // Executing.
        let mut outcome: Option<JobOutcome> = None;
        if failure.is_none() {
            let spec = self.job_spec(payload);
            match self.backend.execute(spec, stop_rx.clone()).await {
                Ok(o) => outcome = Some(o),
                Err(e) => {
                    warn!(experiment = %name, error = %e, "execute phase failed");
                    failure = Some(format!("execution failed: {e}"));
                }
            }
        }
        forwarder.abort();

        // Capturing: best-effort even after a failure, so partial output
        // remains inspectable.
        self.capture(payload, &artifacts).await;

        // Reporting.
        let final_status = match (&failure, outcome) {
            (Some(_), _) => Status::Failed,
            (None, Some(JobOutcome::Stopped)) => Status::Stopped,
            (None, Some(JobOutcome::Completed { exit_code: 0 })) => Status::Finished,
            (None, Some(JobOutcome::Completed { exit_code })) => {
                failure = Some(format!("job exited with code {exit_code}"));
                Status::Failed
            }
            (None, None) => Status::Failed,
        };

        if let Some(detail) = &failure {
            if let Err(e) = self.db.set_detail(&name, detail) {
                warn!(experiment = %name, error = %e, "recording failure detail failed");
            }
        }

        match self.db.set_status(&name, final_status) {
            Ok(()) => {}
            Err(AtelierError::InvalidTransition { .. }) => {
                // Lost the terminal-status race; the winning state stands.
                warn!(experiment = %name, attempted = %final_status, "terminal status already set");
            }
            Err(e) => return Err(e),
        }

        info!(experiment = %name, status = %final_status, "job reported");
        Ok(())
    }

    /// Fetch every input artifact and place it in the workspace under its
    /// key, so the job reads and writes local copies.
    async fn prepare(
        &self,
        payload: &RunPayload,
        artifacts: &BTreeMap<String, ArtifactRef>,
    ) -> Result<()> {
        for (key, artifact) in artifacts {
            if key == WORKSPACE_KEY || key == OUTPUT_KEY {
                continue;
            }

            let src = self
                .store
                .fetch(&self.db, &payload.experiment, artifact)
                .await?;
            let dest = payload.workspace.join(key);
            if src == dest {
                continue;
            }
            if src.is_dir() {
                sync_tree(&src, &dest, false)?;
            } else {
                let bytes = fs::read(&src).with_context(|| format!("reading {src:?}"))?;
                write_file_atomic(&dest, &bytes)?;
            }
            debug!(
                experiment = %payload.experiment,
                key = %key,
                src = %src.display(),
                "input artifact materialized"
            );
        }
        Ok(())
    }

    fn job_spec(&self, payload: &RunPayload) -> JobSpec {
        let mut env = BTreeMap::new();
        env.insert(
            "ATELIER_EXPERIMENT".to_string(),
            payload.experiment.clone(),
        );
        for (k, v) in &payload.hyperparams {
            env.insert(format!("ATELIER_PARAM_{k}"), v.clone());
        }
        for key in payload.artifacts.keys() {
            if key == WORKSPACE_KEY || key == OUTPUT_KEY {
                continue;
            }
            env.insert(
                format!("ATELIER_ARTIFACT_{key}"),
                payload.workspace.join(key).display().to_string(),
            );
        }

        JobSpec {
            experiment: payload.experiment.clone(),
            filename: payload.filename.clone(),
            args: payload.args.clone(),
            env,
            workspace: payload.workspace.clone(),
            output_log: payload.workspace.join(OUTPUT_LOG_RELPATH),
        }
    }

    /// Publish user artifacts per policy, then the workspace tree and the
    /// output log. Individual capture errors are logged, not fatal.
    async fn capture(&self, payload: &RunPayload, artifacts: &BTreeMap<String, ArtifactRef>) {
        let name = &payload.experiment;

        for (key, artifact) in artifacts {
            if key == WORKSPACE_KEY || key == OUTPUT_KEY {
                continue;
            }

            let local = if artifact.policy == CapturePolicy::Reuse {
                // Nothing to upload; the path is unused.
                payload.workspace.join(key)
            } else {
                let in_workspace = payload.workspace.join(key);
                if in_workspace.exists() {
                    in_workspace
                } else if let ArtifactSource::LocalPath { path } = &artifact.source {
                    path.clone()
                } else {
                    warn!(experiment = %name, key = %key, "no local content to capture");
                    continue;
                }
            };

            self.publish_and_record(name, &local, artifact).await;
        }

        // Workspace tree, with excludes applied to a staged copy.
        match self.stage_workspace(&payload.workspace) {
            Ok(staged) => {
                let ws_ref = ArtifactRef::new(
                    WORKSPACE_KEY,
                    ArtifactSource::LocalPath {
                        path: payload.workspace.clone(),
                    },
                    CapturePolicy::AlwaysCapture,
                );
                self.publish_and_record(name, &staged, &ws_ref).await;
                let _ = fs::remove_dir_all(&staged);
            }
            Err(e) => warn!(experiment = %name, error = %e, "workspace staging failed"),
        }

        // Output log, when the job produced one.
        let log_path = payload.workspace.join(OUTPUT_LOG_RELPATH);
        if log_path.exists() {
            let out_ref = ArtifactRef::new(
                OUTPUT_KEY,
                ArtifactSource::LocalPath {
                    path: log_path.clone(),
                },
                CapturePolicy::AlwaysCapture,
            );
            self.publish_and_record(name, &log_path, &out_ref).await;
        }
    }

    async fn publish_and_record(&self, name: &str, local: &Path, artifact: &ArtifactRef) {
        match self.store.publish(local, name, artifact).await {
            Ok(updated) => {
                if let Err(e) = self.db.put_artifact(name, updated) {
                    warn!(experiment = %name, key = %artifact.key, error = %e, "recording artifact failed");
                }
            }
            Err(e) => {
                warn!(experiment = %name, key = %artifact.key, error = %e, "artifact capture failed");
            }
        }
    }

    /// Copy the workspace into a scratch directory, skipping excluded paths.
    fn stage_workspace(&self, workspace: &Path) -> Result<PathBuf> {
        let staged = scratch_dir("workspace");
        fs::create_dir_all(&staged)
            .with_context(|| format!("creating staging directory {staged:?}"))?;

        for entry in walkdir::WalkDir::new(workspace) {
            let entry = entry.map_err(|e| anyhow::anyhow!("walking workspace: {e}"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(workspace)
                .map_err(|e| anyhow::anyhow!("stripping workspace prefix: {e}"))?;
            if self.options.workspace_exclude.is_match(rel) {
                debug!(file = %rel.display(), "workspace capture exclude");
                continue;
            }
            let dest = staged.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating staging directory {parent:?}"))?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("staging {:?}", entry.path()))?;
        }
        Ok(staged)
    }
}

/// Scratch directory under the system temp dir; unique per call.
fn scratch_dir(tag: &str) -> PathBuf {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("atelier-{tag}-{}-{n}", std::process::id()))
}

/// Bridge the queue stop topic and the database stop marker into a single
/// watch channel. The database marker is polled at the worker's interval,
/// so a stop is observed within one polling interval.
fn spawn_stop_forwarder(
    db: Arc<ExperimentDatabase>,
    queue: LocalQueue,
    experiment: String,
    stop_tx: watch::Sender<bool>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut topic = queue.stop_receiver(&experiment);
        if *topic.borrow() || db.stop_requested(&experiment) {
            let _ = stop_tx.send(true);
            return;
        }
        loop {
            tokio::select! {
                changed = topic.changed() => {
                    if changed.is_ok() && *topic.borrow() {
                        let _ = stop_tx.send(true);
                        return;
                    }
                    if changed.is_err() {
                        // Topic sender dropped (queue cleaned); fall back to
                        // marker polling only.
                        tokio::time::sleep(poll_interval).await;
                        if db.stop_requested(&experiment) {
                            let _ = stop_tx.send(true);
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {
                    if db.stop_requested(&experiment) {
                        let _ = stop_tx.send(true);
                        return;
                    }
                }
            }
            if stop_tx.is_closed() {
                return;
            }
        }
    })
}
