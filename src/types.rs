// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical experiment name type used throughout the crate.
pub type ExperimentName = String;

/// Artifact key, unique within its owning experiment.
pub type ArtifactKey = String;

/// Lifecycle status of an experiment.
///
/// Transitions are monotonic along
/// `waiting -> running -> {finished, stopped, failed}`; a transition may
/// never regress, and terminal states absorb. The ordering is expressed by
/// [`Status::rank`] so the database can reject regressions uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Waiting,
    Running,
    Finished,
    Stopped,
    Failed,
}

impl Status {
    /// Position in the monotonic ordering. All terminal states share a rank;
    /// no terminal state may be replaced by another.
    pub fn rank(self) -> u8 {
        match self {
            Status::Waiting => 0,
            Status::Running => 1,
            Status::Finished | Status::Stopped | Status::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` is a valid forward transition.
    pub fn can_transition_to(self, next: Status) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Finished => "finished",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "waiting" => Ok(Status::Waiting),
            "running" => Ok(Status::Running),
            "finished" => Ok(Status::Finished),
            "stopped" => Ok(Status::Stopped),
            "failed" => Ok(Status::Failed),
            other => Err(format!("invalid experiment status: {other}")),
        }
    }
}

/// Outcome of a single job execution, as reported by a `JobBackend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The process ran to completion with the given exit code.
    Completed { exit_code: i32 },
    /// The process was killed in response to a stop request.
    Stopped,
}

impl JobOutcome {
    pub fn success(self) -> bool {
        matches!(self, JobOutcome::Completed { exit_code: 0 })
    }
}
