use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use atelier::client::{Client, ClientOptions};
use atelier::config::{ConfigFile, RawConfigFile};
use atelier::db::{ExperimentDatabase, SubmissionRequest};
use atelier::provenance::GitInfo;
use atelier::queue::LocalQueue;
use atelier::store::{ArtifactRef, ArtifactStore};
use atelier::worker::{JobBackend, Worker, WorkerOptions};

/// Shared harness: temp-dir backed database, store and queue wired the way
/// production wires them, but with fast polling intervals and short waits.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub db: Arc<ExperimentDatabase>,
    pub store: Arc<ArtifactStore>,
    pub queue: LocalQueue,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_store_setup(|store| store)
    }

    /// Like [`TestEnv::new`], but lets the test decorate the store (attach a
    /// cloud backend, tune the HTTP fetcher) before it is shared.
    pub fn with_store_setup(setup: impl FnOnce(ArtifactStore) -> ArtifactStore) -> Self {
        let dir = tempfile::tempdir().expect("creating test dir");
        let db = Arc::new(
            ExperimentDatabase::new(dir.path().join("db")).expect("creating test database"),
        );
        let store =
            ArtifactStore::new(dir.path().join("store")).expect("creating test store");
        let store = Arc::new(setup(store));
        let queue = LocalQueue::new(Duration::from_secs(5));
        Self {
            dir,
            db,
            store,
            queue,
        }
    }

    pub fn client(&self) -> Client {
        Client::new(
            Arc::clone(&self.db),
            Arc::clone(&self.store),
            self.queue.clone(),
            ClientOptions {
                poll_interval: Duration::from_millis(10),
                wait_timeout: Duration::from_secs(5),
            },
        )
    }

    pub fn worker<B: JobBackend>(&self, backend: B) -> Worker<B> {
        let cfg = ConfigFile::try_from(RawConfigFile::default()).expect("default config");
        Worker::new(
            Arc::clone(&self.db),
            Arc::clone(&self.store),
            self.queue.clone(),
            backend,
            WorkerOptions {
                poll_interval: Duration::from_millis(10),
                workspace_exclude: cfg.workspace_exclude_globs().expect("default excludes"),
            },
        )
    }

    /// A fresh workspace directory under the test dir.
    pub fn workspace(&self) -> PathBuf {
        let path = self.dir.path().join("workspace");
        std::fs::create_dir_all(&path).expect("creating test workspace");
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a script file into a workspace and return its path.
pub fn write_script(workspace: &Path, name: &str, contents: &str) -> PathBuf {
    let path = workspace.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("creating script directory");
    }
    std::fs::write(&path, contents).expect("writing test script");
    path
}

/// Builder for `SubmissionRequest` to simplify test setup.
pub struct SubmissionRequestBuilder {
    request: SubmissionRequest,
}

impl SubmissionRequestBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            request: SubmissionRequest {
                name: name.to_string(),
                filename: "job.sh".to_string(),
                args: vec![],
                hyperparams: Default::default(),
                artifacts: Default::default(),
                provenance: None,
            },
        }
    }

    pub fn filename(mut self, filename: &str) -> Self {
        self.request.filename = filename.to_string();
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.request.args.push(arg.to_string());
        self
    }

    pub fn hyperparam(mut self, key: &str, value: &str) -> Self {
        self.request
            .hyperparams
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn artifact(mut self, artifact: ArtifactRef) -> Self {
        self.request.artifacts.insert(artifact.key.clone(), artifact);
        self
    }

    pub fn provenance(mut self, info: GitInfo) -> Self {
        self.request.provenance = Some(info);
        self
    }

    pub fn build(self) -> SubmissionRequest {
        self.request
    }
}
