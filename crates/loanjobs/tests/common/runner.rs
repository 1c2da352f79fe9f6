//! In-process stand-in for the pipeline.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use loanjobs::error::RunnerError;
use loanjobs::runner::{Invocation, OutputObserver, PipelineRunner, RunOutcome};

type Behavior = Box<dyn Fn(&Invocation) -> RunOutcome + Send + Sync>;

/// Runs `behavior` instead of a process and records every invocation.
///
/// Executions registered with `detach` look alive to `is_alive` until
/// `await_detached` collects them.
pub struct ScriptedRunner {
    behavior: Behavior,
    invocations: Mutex<Vec<Invocation>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    alive: Mutex<HashSet<String>>,
    detached: Mutex<HashMap<String, RunOutcome>>,
}

impl ScriptedRunner {
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(&Invocation) -> RunOutcome + Send + Sync + 'static,
    {
        Self {
            behavior: Box::new(behavior),
            invocations: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            alive: Mutex::new(HashSet::new()),
            detached: Mutex::new(HashMap::new()),
        }
    }

    /// Exits 0 printing `stdout`.
    pub fn succeeding(stdout: &str) -> Self {
        let stdout = stdout.to_string();
        Self::new(move |_| exited(0, &stdout, ""))
    }

    pub fn failing(code: i32, stderr: &str) -> Self {
        let stderr = stderr.to_string();
        Self::new(move |_| exited(code, "", &stderr))
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Most executions observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Pretends `job_id` was started by an earlier process and is still
    /// running; `outcome` is what it will leave behind.
    pub fn detach(&self, job_id: &str, outcome: RunOutcome) {
        self.alive.lock().unwrap().insert(job_id.to_string());
        self.detached
            .lock()
            .unwrap()
            .insert(job_id.to_string(), outcome);
    }
}

impl PipelineRunner for ScriptedRunner {
    fn run(
        &self,
        invocation: &Invocation,
        observer: &dyn OutputObserver,
    ) -> Result<RunOutcome, RunnerError> {
        self.invocations.lock().unwrap().push(invocation.clone());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let outcome = (self.behavior)(invocation);
        self.active.fetch_sub(1, Ordering::SeqCst);

        for line in outcome.stdout.lines() {
            observer.on_stdout_line(line);
        }
        Ok(outcome)
    }

    fn is_alive(&self, job_id: &str) -> bool {
        self.alive.lock().unwrap().contains(job_id)
    }

    fn await_detached(
        &self,
        job_id: &str,
        _timeout: Duration,
    ) -> Result<Option<RunOutcome>, RunnerError> {
        self.alive.lock().unwrap().remove(job_id);
        Ok(self.detached.lock().unwrap().remove(job_id))
    }
}

pub fn exited(code: i32, stdout: &str, stderr: &str) -> RunOutcome {
    RunOutcome {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        timed_out: false,
    }
}

pub fn timed_out(stdout: &str) -> RunOutcome {
    RunOutcome {
        exit_code: None,
        stdout: stdout.to_string(),
        stderr: String::new(),
        timed_out: true,
    }
}

/// Value following `flag` in an argv.
pub fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}
