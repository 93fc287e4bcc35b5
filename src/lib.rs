// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod provenance;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{info, warn};

use crate::cli::{CliArgs, CliCommand, RunArgs};
use crate::client::{Client, ClientOptions};
use crate::config::loader::load_or_default;
use crate::config::ConfigFile;
use crate::db::{ExperimentDatabase, SubmissionRequest};
use crate::queue::LocalQueue;
use crate::store::{ArtifactStore, CapturePolicy, EnvCredentials, FsObjectStore};
use crate::types::Status;
use crate::worker::{ProcessJobBackend, Worker, WorkerOptions};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - database / store / queue construction
/// - the orchestrator client
/// - (for `run`) an in-process worker driving the job to completion
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_or_default(args.config.as_deref().map(Path::new))?;
    let services = Services::build(&cfg)?;

    match args.command {
        CliCommand::Run(run_args) => run_experiment(&cfg, &services, run_args).await,
        CliCommand::Stop { experiment } => {
            services.client.stop(&experiment)?;
            println!("stop requested for '{experiment}'");
            Ok(())
        }
        CliCommand::Delete { experiment } => {
            services.client.delete(&experiment)?;
            println!("deleted '{experiment}'");
            Ok(())
        }
        CliCommand::List { prefix } => {
            for name in services.client.list(prefix.as_deref())? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

/// Shared service handles built from config.
struct Services {
    db: Arc<ExperimentDatabase>,
    store: Arc<ArtifactStore>,
    queue: LocalQueue,
    client: Client,
}

impl Services {
    fn build(cfg: &ConfigFile) -> Result<Self> {
        let db = Arc::new(ExperimentDatabase::new(&cfg.database.root)?);

        let mut store = ArtifactStore::new(&cfg.store.root)?;
        if let Some(cloud_root) = &cfg.cloud.root {
            store = store.with_cloud(Box::new(FsObjectStore::new(
                cloud_root.clone(),
                EnvCredentials::new(cfg.cloud.credential_env.clone()),
            )));
        }
        let store = Arc::new(store);

        let queue = LocalQueue::new(Duration::from_secs(cfg.queue.lease_timeout_secs));

        let client = Client::new(
            Arc::clone(&db),
            Arc::clone(&store),
            queue.clone(),
            ClientOptions {
                poll_interval: Duration::from_millis(cfg.run.poll_interval_ms),
                wait_timeout: Duration::from_secs(cfg.run.wait_timeout_secs),
            },
        );

        Ok(Self {
            db,
            store,
            queue,
            client,
        })
    }
}

async fn run_experiment(cfg: &ConfigFile, services: &Services, args: RunArgs) -> Result<()> {
    let workspace = std::env::current_dir()?;
    let name = args
        .experiment
        .clone()
        .unwrap_or_else(|| generated_name(&args.script));

    let request = build_request(&name, &args, &workspace)?;

    // Speculative cleanup of a leftover record with the same name.
    services.client.delete(&name)?;
    services.client.submit(request, &workspace)?;

    // Local mode: this process also runs the worker that executes the job.
    let mut worker = Worker::new(
        Arc::clone(&services.db),
        Arc::clone(&services.store),
        services.queue.clone(),
        ProcessJobBackend::new(),
        WorkerOptions {
            poll_interval: Duration::from_millis(cfg.run.poll_interval_ms),
            workspace_exclude: cfg.workspace_exclude_globs()?,
        },
    );
    worker.run_one().await?;

    let experiment = services.client.wait_until_terminal(&name).await?;
    info!(experiment = %name, status = %experiment.status, "experiment finished");

    match experiment.status {
        Status::Finished => {
            println!("{name}: finished");
            Ok(())
        }
        Status::Stopped => {
            println!("{name}: stopped");
            Ok(())
        }
        status => {
            if let Some(detail) = &experiment.detail {
                warn!(experiment = %name, detail = %detail, "experiment did not finish cleanly");
            }
            anyhow::bail!("experiment '{name}' ended with status '{status}'")
        }
    }
}

fn build_request(name: &str, args: &RunArgs, workspace: &Path) -> Result<SubmissionRequest> {
    let mut artifacts = BTreeMap::new();
    for flag in &args.capture {
        let r = cli::parse_capture(flag, CapturePolicy::AlwaysCapture)
            .map_err(|e| anyhow::anyhow!("--capture: {e}"))?;
        artifacts.insert(r.key.clone(), r);
    }
    for flag in &args.capture_once {
        let r = cli::parse_capture(flag, CapturePolicy::CaptureOnce)
            .map_err(|e| anyhow::anyhow!("--capture-once: {e}"))?;
        artifacts.insert(r.key.clone(), r);
    }
    for flag in &args.reuse {
        let r = cli::parse_reuse(flag).map_err(|e| anyhow::anyhow!("--reuse: {e}"))?;
        artifacts.insert(r.key.clone(), r);
    }

    let mut hyperparams = BTreeMap::new();
    for flag in &args.hyperparam {
        let (k, v) =
            cli::parse_hyperparam(flag).map_err(|e| anyhow::anyhow!("--hyperparam: {e}"))?;
        hyperparams.insert(k, v);
    }

    // Provenance is optional; --force-git collects it even from a dirty
    // tree.
    let provenance = provenance::git_info(workspace, !args.force_git);

    Ok(SubmissionRequest {
        name: name.to_string(),
        filename: args.script.clone(),
        args: args.script_args.clone(),
        hyperparams,
        artifacts,
        provenance,
    })
}

/// Generated experiment name: script stem plus a timestamp suffix.
fn generated_name(script: &str) -> String {
    let stem = PathBuf::from(script)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "experiment".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{stem}-{nanos}")
}
