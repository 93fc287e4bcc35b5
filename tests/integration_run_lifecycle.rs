use std::error::Error;

use atelier::queue::{QueueMessage, RunPayload};
use atelier::types::{JobOutcome, Status};
use atelier::worker::{ProcessJobBackend, OUTPUT_KEY, WORKSPACE_KEY};
use atelier_test_utils::builders::{write_script, SubmissionRequestBuilder, TestEnv};
use atelier_test_utils::fake_backend::FakeJobBackend;
use atelier_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn run_to_finished_preserves_submission() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();
    let workspace = env.workspace();

    let request = SubmissionRequestBuilder::new("hello-world")
        .filename("art_hello_world.py")
        .arg("arg0")
        .hyperparam("learning_rate", "0.01")
        .build();
    client.submit(request, &workspace)?;

    // Visible as waiting before any worker touches it.
    assert_eq!(
        env.db.get_experiment("hello-world")?.status,
        Status::Waiting
    );

    let backend = FakeJobBackend::new();
    let mut worker = env.worker(backend.clone());
    with_timeout(worker.run_one()).await?;

    let experiment = with_timeout(client.wait_until_terminal("hello-world")).await?;
    assert_eq!(experiment.status, Status::Finished);
    // The submission is reproduced exactly, not normalized or reordered.
    assert_eq!(experiment.filename, "art_hello_world.py");
    assert_eq!(experiment.args, vec!["arg0".to_string()]);

    let executed = backend.executed();
    assert_eq!(executed.len(), 1);
    let job = &executed[0];
    assert_eq!(job.filename, "art_hello_world.py");
    assert_eq!(job.args, vec!["arg0".to_string()]);
    assert_eq!(
        job.env.get("ATELIER_EXPERIMENT").map(String::as_str),
        Some("hello-world")
    );
    assert_eq!(
        job.env.get("ATELIER_PARAM_learning_rate").map(String::as_str),
        Some("0.01")
    );
    Ok(())
}

#[tokio::test]
async fn nonzero_exit_reports_failed_with_detail() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    client.submit(
        SubmissionRequestBuilder::new("bad-job").build(),
        &env.workspace(),
    )?;

    let backend = FakeJobBackend::new();
    backend.push_outcome(JobOutcome::Completed { exit_code: 3 });
    let mut worker = env.worker(backend);
    with_timeout(worker.run_one()).await?;

    let experiment = with_timeout(client.wait_until_terminal("bad-job")).await?;
    assert_eq!(experiment.status, Status::Failed);
    let detail = experiment.detail.expect("failure detail recorded");
    assert!(detail.contains("exited with code 3"), "detail: {detail}");
    Ok(())
}

#[tokio::test]
async fn duplicate_run_delivery_executes_once() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();
    let workspace = env.workspace();

    client.submit(
        SubmissionRequestBuilder::new("dup-exp").build(),
        &workspace,
    )?;

    // At-least-once delivery: a second copy of the run message may arrive.
    env.queue.enqueue(QueueMessage::run(RunPayload {
        experiment: "dup-exp".to_string(),
        filename: "job.sh".to_string(),
        args: vec![],
        hyperparams: Default::default(),
        artifacts: Default::default(),
        workspace: workspace.clone(),
    }))?;

    let backend = FakeJobBackend::new();
    let mut worker = env.worker(backend.clone());
    with_timeout(worker.run_one()).await?;
    with_timeout(worker.run_one()).await?;

    assert_eq!(backend.executed().len(), 1);
    let experiment = with_timeout(client.wait_until_terminal("dup-exp")).await?;
    assert_eq!(experiment.status, Status::Finished);
    Ok(())
}

#[tokio::test]
async fn run_for_deleted_experiment_is_skipped() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    client.submit(
        SubmissionRequestBuilder::new("gone").build(),
        &env.workspace(),
    )?;
    client.delete("gone")?;

    let backend = FakeJobBackend::new();
    let mut worker = env.worker(backend.clone());
    with_timeout(worker.run_one()).await?;

    assert!(backend.executed().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_processing_leaves_lease_for_redelivery() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    client.submit(
        SubmissionRequestBuilder::new("broken").build(),
        &env.workspace(),
    )?;

    // Corrupt the record so processing fails before anything is reported.
    let record = env
        .dir
        .path()
        .join("db")
        .join("experiments")
        .join("broken")
        .join("record.json");
    std::fs::write(&record, b"not json")?;

    let backend = FakeJobBackend::new();
    let mut worker = env.worker(backend.clone());
    assert!(worker.run_one().await.is_err());
    assert!(backend.executed().is_empty());

    // The lease was not acknowledged; after it expires the message is
    // delivered again.
    let leased = env.queue.dequeue().await;
    assert_eq!(leased.message.experiment, "broken");
    env.queue.acknowledge(&leased)?;
    Ok(())
}

#[tokio::test]
async fn process_backend_captures_workspace_and_output() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();
    let workspace = env.workspace();

    write_script(
        &workspace,
        "job.sh",
        "echo hello from job\nprintf 'result' > result.txt\n",
    );

    client.submit(
        SubmissionRequestBuilder::new("script-run").build(),
        &workspace,
    )?;

    let mut worker = env.worker(ProcessJobBackend::new());
    with_timeout(worker.run_one()).await?;

    let experiment = with_timeout(client.wait_until_terminal("script-run")).await?;
    assert_eq!(experiment.status, Status::Finished);
    assert!(experiment.artifacts.contains_key(WORKSPACE_KEY));
    assert!(experiment.artifacts.contains_key(OUTPUT_KEY));

    let out = env.dir.path().join("downloaded-output.log");
    with_timeout(client.download_artifact("script-run", OUTPUT_KEY, &out)).await?;
    let log = std::fs::read_to_string(&out)?;
    assert!(log.contains("hello from job"), "log: {log}");

    // A full sync of the captured workspace recovers every file
    // byte-for-byte, including those the job wrote.
    let restored = env.dir.path().join("restored");
    with_timeout(client.sync_workspace("script-run", &restored, false)).await?;
    assert_eq!(std::fs::read(restored.join("result.txt"))?, b"result");
    assert_eq!(
        std::fs::read(restored.join("job.sh"))?,
        std::fs::read(workspace.join("job.sh"))?
    );
    // The job log lives outside the workspace artifact.
    assert!(!restored.join(".atelier").join("output.log").exists());
    Ok(())
}
