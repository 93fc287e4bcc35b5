// src/queue/local.rs

//! In-process queue implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{AtelierError, Result};
use crate::queue::{QueueCommand, QueueMessage};
use crate::types::ExperimentName;

/// A dequeued message held under a lease. Acknowledge it on successful
/// processing; otherwise it becomes visible to another worker after the
/// lease timeout.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub lease_id: u64,
    pub message: QueueMessage,
}

#[derive(Debug)]
struct Lease {
    message: QueueMessage,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<QueueMessage>,
    leased: HashMap<u64, Lease>,
    next_lease_id: u64,
    stop_topics: HashMap<ExperimentName, watch::Sender<bool>>,
}

/// Shared in-process queue. Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    lease_timeout: Duration,
}

impl LocalQueue {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                lease_timeout,
            }),
        }
    }

    /// Enqueue a message.
    ///
    /// `run` messages join the main backlog; `stop` commands are routed to
    /// the out-of-band side topic so they are never stuck behind unrelated
    /// work.
    pub fn enqueue(&self, message: QueueMessage) -> Result<()> {
        match &message.command {
            QueueCommand::Stop => {
                self.send_stop(&message.experiment);
                Ok(())
            }
            QueueCommand::Run(_) => {
                let mut state = self.lock_state();
                debug!(experiment = %message.experiment, "enqueued run message");
                state.ready.push_back(message);
                drop(state);
                self.inner.notify.notify_one();
                Ok(())
            }
        }
    }

    /// Block until a message is available, then lease it.
    ///
    /// There is no fixed overall timeout; the wait also wakes periodically
    /// to reclaim expired leases.
    pub async fn dequeue(&self) -> LeasedMessage {
        loop {
            let wait_hint = {
                let mut state = self.lock_state();
                self.reclaim_expired(&mut state);

                if let Some(message) = state.ready.pop_front() {
                    let lease_id = state.next_lease_id;
                    state.next_lease_id += 1;
                    state.leased.insert(
                        lease_id,
                        Lease {
                            message: message.clone(),
                            deadline: Instant::now() + self.inner.lease_timeout,
                        },
                    );
                    debug!(
                        experiment = %message.experiment,
                        lease_id,
                        "message dequeued under lease"
                    );
                    return LeasedMessage { lease_id, message };
                }

                // Wake at the earliest lease expiry so redelivery is timely.
                state
                    .leased
                    .values()
                    .map(|l| l.deadline)
                    .min()
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or(self.inner.lease_timeout)
            };

            let _ = tokio::time::timeout(wait_hint, self.inner.notify.notified()).await;
        }
    }

    /// Acknowledge successful processing, retiring the lease.
    pub fn acknowledge(&self, leased: &LeasedMessage) -> Result<()> {
        let mut state = self.lock_state();
        if state.leased.remove(&leased.lease_id).is_none() {
            // Lease already expired and was redelivered elsewhere.
            warn!(
                experiment = %leased.message.experiment,
                lease_id = leased.lease_id,
                "acknowledge for unknown or expired lease"
            );
            return Err(AtelierError::QueueError(format!(
                "lease {} is no longer held",
                leased.lease_id
            )));
        }
        debug!(
            experiment = %leased.message.experiment,
            lease_id = leased.lease_id,
            "message acknowledged"
        );
        Ok(())
    }

    /// Signal a stop to whichever worker holds the named experiment.
    pub fn send_stop(&self, experiment: &str) {
        let mut state = self.lock_state();
        let sender = state
            .stop_topics
            .entry(experiment.to_string())
            .or_insert_with(|| watch::channel(false).0);
        let _ = sender.send(true);
        info!(experiment = %experiment, "stop signal published");
    }

    /// Subscribe to the stop side topic for an experiment.
    pub fn stop_receiver(&self, experiment: &str) -> watch::Receiver<bool> {
        let mut state = self.lock_state();
        state
            .stop_topics
            .entry(experiment.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Reset all queue state (backlog, leases, stop topics).
    pub fn clean(&self) {
        let mut state = self.lock_state();
        let dropped = state.ready.len() + state.leased.len();
        *state = State::default();
        if dropped > 0 {
            info!(dropped, "queue cleaned");
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Number of messages waiting for delivery (not counting leased ones).
    pub fn backlog_len(&self) -> usize {
        self.lock_state().ready.len()
    }

    fn reclaim_expired(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<u64> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(lease) = state.leased.remove(&id) {
                warn!(
                    experiment = %lease.message.experiment,
                    lease_id = id,
                    "lease expired; requeueing message"
                );
                state.ready.push_front(lease.message);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RunPayload;
    use std::path::PathBuf;

    fn run_message(name: &str) -> QueueMessage {
        QueueMessage::run(RunPayload {
            experiment: name.to_string(),
            filename: "job.py".to_string(),
            args: vec![],
            hyperparams: Default::default(),
            artifacts: Default::default(),
            workspace: PathBuf::from("."),
        })
    }

    #[tokio::test]
    async fn dequeue_then_acknowledge() {
        let queue = LocalQueue::new(Duration::from_secs(5));
        queue.enqueue(run_message("exp")).unwrap();

        let leased = queue.dequeue().await;
        assert_eq!(leased.message.experiment, "exp");
        queue.acknowledge(&leased).unwrap();
        assert_eq!(queue.backlog_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_message_is_redelivered() {
        let queue = LocalQueue::new(Duration::from_millis(100));
        queue.enqueue(run_message("exp")).unwrap();

        let first = queue.dequeue().await;
        // Never acknowledged; after the lease timeout it comes back.
        let second = queue.dequeue().await;
        assert_eq!(second.message.experiment, "exp");
        assert_ne!(first.lease_id, second.lease_id);

        // The stale lease can no longer be acknowledged.
        assert!(queue.acknowledge(&first).is_err());
        queue.acknowledge(&second).unwrap();
    }

    #[tokio::test]
    async fn stop_routes_out_of_band() {
        let queue = LocalQueue::new(Duration::from_secs(5));
        let mut rx = queue.stop_receiver("exp");
        assert!(!*rx.borrow());

        // A stop enqueued behind a backlog of runs is still visible
        // immediately on the side topic.
        queue.enqueue(run_message("other-1")).unwrap();
        queue.enqueue(run_message("other-2")).unwrap();
        queue.enqueue(QueueMessage::stop("exp")).unwrap();

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert_eq!(queue.backlog_len(), 2);
    }

    #[tokio::test]
    async fn clean_resets_everything() {
        let queue = LocalQueue::new(Duration::from_secs(5));
        queue.enqueue(run_message("a")).unwrap();
        queue.send_stop("a");
        queue.clean();
        assert_eq!(queue.backlog_len(), 0);
        assert!(!*queue.stop_receiver("a").borrow());
    }
}
