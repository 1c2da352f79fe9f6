//! Launching the external pipeline.

pub mod command;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::RunnerError;

pub use command::PipelineCommand;
pub use process::ProcessGroupRunner;

static RE_RUN_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"run_id\s*=\s*(\S+)").unwrap());

/// A fully resolved pipeline execution, tagged with the job it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub job_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub timeout: Duration,
}

/// What a finished (or killed) execution produced. Output is already
/// bounded by the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Receives stdout lines while a job runs. Delivery is best-effort; the
/// captured output stays authoritative.
pub trait OutputObserver: Send + Sync {
    fn on_stdout_line(&self, line: &str);
}

/// Observer that drops everything.
pub struct NoopObserver;

impl OutputObserver for NoopObserver {
    fn on_stdout_line(&self, _line: &str) {}
}

pub trait PipelineRunner: Send + Sync {
    /// Runs to completion or timeout.
    fn run(
        &self,
        invocation: &Invocation,
        observer: &dyn OutputObserver,
    ) -> Result<RunOutcome, RunnerError>;

    /// Whether an execution tagged `job_id` is still running, possibly
    /// started by an earlier orchestrator process.
    fn is_alive(&self, job_id: &str) -> bool;

    /// Waits for a detached execution to exit and collects its outcome.
    /// `Ok(None)` if nothing is known about `job_id`.
    fn await_detached(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Option<RunOutcome>, RunnerError>;
}

/// First `run_id = <value>` printed by the pipeline.
pub fn parse_run_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| RE_RUN_ID.captures(line))
        .map(|caps| caps[1].trim().to_string())
}
