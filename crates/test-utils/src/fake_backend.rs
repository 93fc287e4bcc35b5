use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use atelier::errors::Result;
use atelier::types::JobOutcome;
use atelier::worker::{JobBackend, JobSpec};

/// A fake backend that:
/// - records every `JobSpec` it was asked to run
/// - returns scripted outcomes (default: completed with exit code 0)
///
/// Clones share the same recorded state, so tests keep a clone before
/// handing the backend to a worker.
#[derive(Clone, Default)]
pub struct FakeJobBackend {
    executed: Arc<Mutex<Vec<JobSpec>>>,
    outcomes: Arc<Mutex<VecDeque<JobOutcome>>>,
}

impl FakeJobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next execution.
    pub fn push_outcome(&self, outcome: JobOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// All job specs executed so far, in order.
    pub fn executed(&self) -> Vec<JobSpec> {
        self.executed.lock().unwrap().clone()
    }
}

impl JobBackend for FakeJobBackend {
    fn execute(
        &mut self,
        job: JobSpec,
        _stop: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<JobOutcome>> + Send + '_>> {
        let executed = Arc::clone(&self.executed);
        let outcomes = Arc::clone(&self.outcomes);

        Box::pin(async move {
            executed.lock().unwrap().push(job);
            let outcome = outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(JobOutcome::Completed { exit_code: 0 });
            Ok(outcome)
        })
    }
}

/// A backend whose job blocks until the test releases it.
///
/// The job reports "started" through the paired [`JobControl`], then waits
/// for either a scripted outcome from the test or a stop request from the
/// worker (which wins as [`JobOutcome::Stopped`]).
pub struct ControllableJobBackend {
    started_tx: watch::Sender<bool>,
    finish_rx: watch::Receiver<Option<JobOutcome>>,
}

/// Test-side handle for a [`ControllableJobBackend`].
pub struct JobControl {
    started_rx: watch::Receiver<bool>,
    finish_tx: watch::Sender<Option<JobOutcome>>,
}

/// Build a controllable backend and its test-side handle.
pub fn controllable() -> (ControllableJobBackend, JobControl) {
    let (started_tx, started_rx) = watch::channel(false);
    let (finish_tx, finish_rx) = watch::channel(None);
    (
        ControllableJobBackend {
            started_tx,
            finish_rx,
        },
        JobControl {
            started_rx,
            finish_tx,
        },
    )
}

impl JobControl {
    /// Wait until the backend has started executing a job.
    pub async fn wait_started(&mut self) {
        while !*self.started_rx.borrow() {
            self.started_rx
                .changed()
                .await
                .expect("controllable backend dropped before starting");
        }
    }

    /// Let the in-flight job complete with the given outcome.
    pub fn finish(&self, outcome: JobOutcome) {
        let _ = self.finish_tx.send(Some(outcome));
    }
}

impl JobBackend for ControllableJobBackend {
    fn execute(
        &mut self,
        _job: JobSpec,
        mut stop: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<JobOutcome>> + Send + '_>> {
        let started = self.started_tx.clone();
        let mut finish = self.finish_rx.clone();

        Box::pin(async move {
            let _ = started.send(true);

            if *stop.borrow() {
                return Ok(JobOutcome::Stopped);
            }
            if let Some(outcome) = *finish.borrow_and_update() {
                return Ok(outcome);
            }

            let mut stop_open = true;
            loop {
                tokio::select! {
                    changed = finish.changed() => {
                        if changed.is_err() {
                            // Control handle dropped; finish cleanly.
                            return Ok(JobOutcome::Completed { exit_code: 0 });
                        }
                        if let Some(outcome) = *finish.borrow_and_update() {
                            return Ok(outcome);
                        }
                    }
                    changed = stop.changed(), if stop_open => {
                        match changed {
                            Ok(()) if *stop.borrow() => return Ok(JobOutcome::Stopped),
                            Ok(()) => {}
                            Err(_) => stop_open = false,
                        }
                    }
                }
            }
        })
    }
}
