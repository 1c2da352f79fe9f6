use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::JobStatus;
use crate::sanitize::truncate_tail;

/// Result summary attached to a finished job, derived from the completion
/// manifest (or, for query jobs, from the run directory).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResultSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_base: Option<String>,
}

/// Persisted state of one pipeline execution request.
///
/// Unset optional fields are written as `null` so the on-disk shape is
/// stable; `job_key` is internal and never leaves the crate via [`JobView`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub tenant_id: String,
    pub loan_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: JobStatus,
    #[serde(alias = "created_at_utc")]
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "started_at_utc")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "finished_at_utc")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request: Map<String, Value>,
    #[serde(default)]
    pub result: Option<JobResultSummary>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
}

impl JobRecord {
    pub fn new_pending(
        tenant_id: &str,
        loan_id: &str,
        run_id: Option<String>,
        request: Map<String, Value>,
        job_key: String,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            loan_id: loan_id.to_string(),
            run_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            request,
            result: None,
            error: None,
            stdout: None,
            stderr: None,
            job_key: Some(job_key),
        }
    }

    /// A record for work that a completion manifest already proves done.
    pub fn new_completed(
        tenant_id: &str,
        loan_id: &str,
        run_id: String,
        request: Map<String, Value>,
        job_key: String,
        result: JobResultSummary,
    ) -> Self {
        let now = Utc::now();
        let mut record = Self::new_pending(tenant_id, loan_id, Some(run_id), request, job_key);
        record.status = JobStatus::Success;
        record.created_at = now;
        record.started_at = Some(now);
        record.finished_at = Some(now);
        record.result = Some(result);
        record.stdout = Some(phase_line("DONE"));
        record
    }

    /// `Pending -> Running`. Returns false (and changes nothing) from any
    /// other state.
    pub fn mark_running(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Moves a live job to a terminal status. A job that never started is
    /// allowed to fail directly (lock or request errors before launch).
    pub fn finish(&mut self, status: JobStatus) -> bool {
        let allowed = match (self.status, status) {
            (JobStatus::Running, JobStatus::Success | JobStatus::Fail) => true,
            (JobStatus::Pending, JobStatus::Fail) => true,
            _ => false,
        };
        if !allowed {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Appends a `PHASE:<name> <timestamp>` marker to stdout, keeping the
    /// field within `max_bytes`.
    pub fn append_phase(&mut self, name: &str, max_bytes: usize) {
        let mut stdout = self.stdout.take().unwrap_or_default();
        stdout.push_str(&phase_line(name));
        self.stdout = Some(truncate_tail(&stdout, max_bytes));
    }

    /// Query jobs answer a question against an existing run.
    pub fn is_query(&self) -> bool {
        self.request.contains_key("question")
    }
}

fn phase_line(name: &str) -> String {
    format!(
        "PHASE:{} {}\n",
        name,
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

/// Caller-facing projection of a [`JobRecord`]: no `job_key`, no nulls.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobView {
    pub job_id: String,
    pub tenant_id: String,
    pub loan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub request: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            tenant_id: record.tenant_id,
            loan_id: record.loan_id,
            run_id: record.run_id,
            status: record.status,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            request: record.request,
            result: record.result,
            error: record.error,
            stdout: record.stdout,
            stderr: record.stderr,
        }
    }
}

/// Returned by `enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub status_url: String,
}

impl EnqueueResponse {
    pub fn new(job_id: &str, status: JobStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            status_url: format!("/jobs/{}", job_id),
        }
    }
}
