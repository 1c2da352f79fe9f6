use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_PATH: &str = "/mnt/nas_apps/nas_analyze";

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct JobsConfig {
    /// Root of the shared store (job records, index, locks, heartbeat).
    pub base_path: PathBuf,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutsConfig,
    pub worker: WorkerConfig,
    pub pipeline: PipelineSettings,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            worker: WorkerConfig::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl JobsConfig {
    /// Default configuration rooted at `base_path`.
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitsConfig {
    pub stdout_max_bytes: usize,
    pub stderr_max_bytes: usize,
    pub error_max_bytes: usize,
    /// Upper bound on records read by a full scan.
    pub reload_limit: usize,
    pub list_default_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            stdout_max_bytes: 50_000,
            stderr_max_bytes: 50_000,
            error_max_bytes: 4_000,
            reload_limit: 500,
            list_default_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutsConfig {
    pub job_timeout_secs: u64,
    pub lock_wait_secs: u64,
    pub lock_retry_millis: u64,
    /// Time between SIGTERM and SIGKILL when a process group is terminated.
    pub kill_grace_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 3600,
            lock_wait_secs: 3600,
            lock_retry_millis: 2000,
            kill_grace_secs: 20,
        }
    }
}

impl TimeoutsConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_millis)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub poll_interval_millis: u64,
    pub concurrency: usize,
    pub claim_stale_secs: u64,
    pub heartbeat_max_age_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_millis: 2000,
            concurrency: 1,
            claim_stale_secs: 300,
            heartbeat_max_age_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn claim_stale(&self) -> Duration {
        Duration::from_secs(self.claim_stale_secs)
    }

    pub fn heartbeat_max_age(&self) -> Duration {
        Duration::from_secs(self.heartbeat_max_age_secs)
    }

    /// A third of the max age, at least one second.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.heartbeat_max_age() / 3).max(Duration::from_secs(1))
    }
}

/// How the external pipeline is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineSettings {
    pub program: String,
    /// Arguments placed before the generated ones.
    pub args: Vec<String>,
    pub query_program: String,
    pub query_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Extra environment for every invocation.
    pub env: BTreeMap<String, String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["scripts/run_loan_job.py".to_string()],
            query_program: "python3".to_string(),
            query_args: vec!["scripts/run_loan_query.py".to_string()],
            working_directory: None,
            env: BTreeMap::new(),
        }
    }
}
