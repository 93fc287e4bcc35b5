// src/store/http.rs

//! HTTP(S) artifact fetching with retry and backoff.
//!
//! Transient failures (connection errors, timeouts, 5xx responses) are
//! retried with doubling backoff up to a bounded attempt count before
//! surfacing a transient `Fetch` error. Permanent failures (404 and other
//! 4xx) fail immediately.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{AtelierError, Result};
use crate::store::transfer::write_file_atomic;

const DEFAULT_MAX_ATTEMPTS: usize = 4;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Reusable HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_attempts: usize,
    initial_backoff: Duration,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_BACKOFF)
    }
}

impl HttpFetcher {
    pub fn new(max_attempts: usize, initial_backoff: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Download `url` into `dest` (atomic from the reader's point of view).
    pub async fn fetch_to(&self, url: &str, dest: &Path) -> Result<()> {
        let mut backoff = self.initial_backoff;
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            match self.try_fetch(url, dest).await {
                Ok(()) => {
                    debug!(url = %url, attempt, "http fetch succeeded");
                    return Ok(());
                }
                Err(FetchAttemptError::Permanent(reason)) => {
                    return Err(AtelierError::fetch_permanent(url, reason));
                }
                Err(FetchAttemptError::Transient(reason)) => {
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts = self.max_attempts,
                        reason = %reason,
                        "transient http fetch failure"
                    );
                    last_reason = reason;
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(AtelierError::fetch_transient(
            url,
            format!("{last_reason} (after {} attempts)", self.max_attempts),
        ))
    }

    async fn try_fetch(&self, url: &str, dest: &Path) -> std::result::Result<(), FetchAttemptError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                FetchAttemptError::Transient(e.to_string())
            } else {
                FetchAttemptError::Permanent(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(FetchAttemptError::Transient(format!("server error {status}")));
        }
        if !status.is_success() {
            return Err(FetchAttemptError::Permanent(format!("http status {status}")));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchAttemptError::Transient(format!("reading body: {e}")))?;

        write_file_atomic(dest, &bytes)
            .map_err(|e| FetchAttemptError::Permanent(format!("writing {dest:?}: {e}")))?;

        Ok(())
    }
}

enum FetchAttemptError {
    Transient(String),
    Permanent(String),
}
