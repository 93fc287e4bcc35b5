// src/worker/backend.rs

//! Pluggable job execution backend.
//!
//! The worker talks to a `JobBackend` instead of spawning processes
//! directly. Production uses [`ProcessJobBackend`]; tests provide their own
//! implementation that simulates job behavior without real processes.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::types::{ExperimentName, JobOutcome};

/// Everything a backend needs to run one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub experiment: ExperimentName,
    /// Script to execute, relative to `workspace`.
    pub filename: String,
    pub args: Vec<String>,
    /// Extra environment (hyperparameters, artifact paths).
    pub env: BTreeMap<String, String>,
    /// Working directory of the job.
    pub workspace: PathBuf,
    /// File receiving combined stdout/stderr.
    pub output_log: PathBuf,
}

/// Trait abstracting how a claimed job is executed.
///
/// The stop receiver flips to `true` when a stop has been requested; the
/// backend must terminate the job promptly and report
/// [`JobOutcome::Stopped`].
pub trait JobBackend: Send {
    fn execute(
        &mut self,
        job: JobSpec,
        stop: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<JobOutcome>> + Send + '_>>;
}

/// Real backend: spawns the script as a child process.
///
/// `.py` scripts run under `python3`, `.sh` under `sh`, anything else is
/// executed directly.
pub struct ProcessJobBackend;

impl ProcessJobBackend {
    pub fn new() -> Self {
        Self
    }

    fn build_command(job: &JobSpec) -> Command {
        let script = job.workspace.join(&job.filename);
        let mut cmd = if job.filename.ends_with(".py") {
            let mut c = Command::new("python3");
            c.arg(&script);
            c
        } else if job.filename.ends_with(".sh") {
            let mut c = Command::new("sh");
            c.arg(&script);
            c
        } else {
            Command::new(&script)
        };
        cmd.args(&job.args);
        cmd.current_dir(&job.workspace);
        cmd.envs(&job.env);
        cmd
    }
}

impl Default for ProcessJobBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBackend for ProcessJobBackend {
    fn execute(
        &mut self,
        job: JobSpec,
        stop: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<JobOutcome>> + Send + '_>> {
        Box::pin(run_process(job, stop))
    }
}

async fn run_process(job: JobSpec, mut stop: watch::Receiver<bool>) -> Result<JobOutcome> {
    info!(
        experiment = %job.experiment,
        filename = %job.filename,
        args = ?job.args,
        "starting job process"
    );

    let mut cmd = ProcessJobBackend::build_command(&job);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning job process for '{}'", job.experiment))?;

    // Funnel both streams through one writer so the log stays line-atomic.
    let (line_tx, line_rx) = mpsc::channel::<String>(64);

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone(), job.experiment.clone(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx.clone(), job.experiment.clone(), "stderr");
    }
    drop(line_tx);

    let writer = tokio::spawn(write_log(job.output_log.clone(), line_rx));

    // Either the process exits on its own, or a stop request arrives and we
    // kill it. A stopped job reports `Stopped`, never a failure.
    let outcome = loop {
        tokio::select! {
            status_res = child.wait() => {
                let status = status_res
                    .with_context(|| format!("waiting for job process of '{}'", job.experiment))?;
                let code = status.code().unwrap_or(-1);
                info!(
                    experiment = %job.experiment,
                    exit_code = code,
                    success = status.success(),
                    "job process exited"
                );
                break JobOutcome::Completed { exit_code: code };
            }

            changed = stop.changed() => {
                if changed.is_err() {
                    // Stop channel closed; keep waiting on the child.
                    continue;
                }
                if !*stop.borrow() {
                    continue;
                }
                info!(experiment = %job.experiment, "stop requested; killing job process");
                if let Err(e) = child.kill().await {
                    warn!(
                        experiment = %job.experiment,
                        error = %e,
                        "failed to kill job process on stop"
                    );
                }
                break JobOutcome::Stopped;
            }
        }
    };

    // Let the readers drain remaining output before the log is captured.
    let _ = writer.await;

    Ok(outcome)
}

fn spawn_line_reader(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
    experiment: ExperimentName,
    stream_name: &'static str,
) {
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(experiment = %experiment, "{stream_name}: {line}");
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

async fn write_log(path: PathBuf, mut rx: mpsc::Receiver<String>) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;

    let mut file = match file {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open job output log");
            while rx.recv().await.is_some() {}
            return;
        }
    };

    while let Some(line) = rx.recv().await {
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.write_all(b"\n").await;
    }
    let _ = file.flush().await;
}
