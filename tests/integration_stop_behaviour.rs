use std::error::Error;

use atelier::errors::AtelierError;
use atelier::types::{JobOutcome, Status};
use atelier_test_utils::builders::{SubmissionRequestBuilder, TestEnv};
use atelier_test_utils::fake_backend::{controllable, FakeJobBackend};
use atelier_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn stop_while_running_reports_stopped() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    client.submit(
        SubmissionRequestBuilder::new("long-job").build(),
        &env.workspace(),
    )?;

    let (backend, mut control) = controllable();
    let mut worker = env.worker(backend);
    let worker_task = tokio::spawn(async move { worker.run_one().await });

    with_timeout(control.wait_started()).await;
    assert_eq!(env.db.get_experiment("long-job")?.status, Status::Running);

    client.stop("long-job")?;
    // Stopping twice is a no-op, not an error.
    client.stop("long-job")?;

    let experiment = with_timeout(client.wait_until_terminal("long-job")).await?;
    assert_eq!(experiment.status, Status::Stopped);
    with_timeout(worker_task).await??;
    Ok(())
}

#[tokio::test]
async fn stop_requested_before_claim_still_stops() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    client.submit(
        SubmissionRequestBuilder::new("early-stop").build(),
        &env.workspace(),
    )?;
    // Stop lands while the experiment is still waiting in the queue.
    client.stop("early-stop")?;

    let (backend, _control) = controllable();
    let mut worker = env.worker(backend);
    with_timeout(worker.run_one()).await?;

    let experiment = with_timeout(client.wait_until_terminal("early-stop")).await?;
    assert_eq!(experiment.status, Status::Stopped);
    Ok(())
}

#[tokio::test]
async fn stop_after_terminal_is_a_noop() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    client.submit(
        SubmissionRequestBuilder::new("done-job").build(),
        &env.workspace(),
    )?;
    let mut worker = env.worker(FakeJobBackend::new());
    with_timeout(worker.run_one()).await?;

    let experiment = with_timeout(client.wait_until_terminal("done-job")).await?;
    assert_eq!(experiment.status, Status::Finished);

    client.stop("done-job")?;
    assert_eq!(env.db.get_experiment("done-job")?.status, Status::Finished);
    Ok(())
}

#[tokio::test]
async fn stop_of_missing_experiment_is_not_found() {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    let err = client.stop("ghost").unwrap_err();
    assert!(matches!(err, AtelierError::NotFound(_)), "got: {err}");
}

#[tokio::test]
async fn finished_job_wins_over_late_stop() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let client = env.client();

    client.submit(
        SubmissionRequestBuilder::new("quick-job").build(),
        &env.workspace(),
    )?;

    let (backend, mut control) = controllable();
    let mut worker = env.worker(backend);
    let worker_task = tokio::spawn(async move { worker.run_one().await });

    with_timeout(control.wait_started()).await;
    control.finish(JobOutcome::Completed { exit_code: 0 });
    with_timeout(worker_task).await??;

    // The job completed before the stop arrived; the terminal status holds.
    let experiment = with_timeout(client.wait_until_terminal("quick-job")).await?;
    assert_eq!(experiment.status, Status::Finished);
    client.stop("quick-job")?;
    assert_eq!(env.db.get_experiment("quick-job")?.status, Status::Finished);
    Ok(())
}
