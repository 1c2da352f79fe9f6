//! Job records, their lifecycle states and the typed request they carry.

pub mod record;
pub mod request;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use record::{EnqueueResponse, JobRecord, JobResultSummary, JobView};
pub use request::JobRequest;

/// Lifecycle state of a job.
///
/// Transitions only move forward: `Pending -> Running -> {Success | Fail}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Fail,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Fail => "FAIL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Fail)
    }

    /// Statuses that keep a job's idempotency key bound to it.
    pub fn holds_key(&self) -> bool {
        !matches!(self, JobStatus::Fail)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAIL" | "FAILED" => Ok(JobStatus::Fail),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}
