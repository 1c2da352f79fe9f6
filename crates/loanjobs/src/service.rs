//! The job state machine: enqueue, read, execute one job, recover on start.
//!
//! Disk is the only source of truth. Nothing here caches records; every
//! read goes through [`JobStore`], so a record changed by another worker
//! process is visible on the next call.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, info_span, warn};

use crate::artifact::ArtifactLocator;
use crate::broadcast::{JobEvent, JobEventBroadcaster};
use crate::config::JobsConfig;
use crate::error::{LoanJobsError, LockError, Result, RunnerError, StoreError};
use crate::idempotency::{fingerprint, ClaimOutcome, KeyIndex};
use crate::job::request::check_component;
use crate::job::{EnqueueResponse, JobRecord, JobRequest, JobStatus, JobView};
use crate::lock::ResourceLock;
use crate::runner::{
    parse_run_id, Invocation, NoopObserver, PipelineCommand, PipelineRunner, RunOutcome,
};
use crate::sanitize::truncate_tail;
use crate::store::{JobFilter, JobStore};
use crate::worker::heartbeat::{Heartbeat, HeartbeatStatus};

/// How long a key entry may point at a record that has not been written yet
/// before it is considered abandoned.
const KEY_PENDING_GRACE_SECS: i64 = 30;
const ENQUEUE_ATTEMPTS: u32 = 3;

pub const ORPHANED_ERROR: &str =
    "Recovered after restart: job was RUNNING but no active worker (orphaned by restart)";

/// Result of one `run_one` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOneOutcome {
    /// The job ran (or failed before launch) and now has this terminal status.
    Finished(JobStatus),
    NotFound,
    /// Another worker holds the claim.
    NotClaimed,
    /// No longer PENDING.
    NotPending,
    /// The loan stayed locked for the whole wait; the job is still PENDING.
    LockBusy,
}

/// What `recover_on_startup` found and did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub recovered_success: Vec<String>,
    pub recovered_fail: Vec<String>,
    /// Still executing under a previous orchestrator; a watcher finalizes each.
    pub still_running: Vec<String>,
    /// Left for the worker loop.
    pub pending: Vec<String>,
    /// Loan locks left behind by jobs that can no longer be using them.
    pub released_locks: usize,
    watchers: Vec<JoinHandle<()>>,
}

impl RecoveryReport {
    /// Blocks until every watcher has finalized its job.
    pub fn wait_for_watchers(&mut self) {
        for handle in self.watchers.drain(..) {
            if handle.join().is_err() {
                warn!("Recovery watcher panicked");
            }
        }
    }
}

#[derive(Clone)]
pub struct JobService {
    config: Arc<JobsConfig>,
    store: JobStore,
    keys: KeyIndex,
    lock: ResourceLock,
    artifacts: ArtifactLocator,
    heartbeat: Heartbeat,
    runner: Arc<dyn PipelineRunner>,
    events: Option<JobEventBroadcaster>,
}

impl JobService {
    pub fn new(config: JobsConfig, runner: Arc<dyn PipelineRunner>) -> Self {
        let base = config.base_path.clone();
        Self {
            store: JobStore::new(&base),
            keys: KeyIndex::new(&base),
            lock: ResourceLock::new(&base, config.timeouts.lock_retry()),
            artifacts: ArtifactLocator::new(&base),
            heartbeat: Heartbeat::new(&base),
            config: Arc::new(config),
            runner,
            events: None,
        }
    }

    pub fn with_events(mut self, events: JobEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Records the intent to run the pipeline; never executes anything.
    ///
    /// A submission identical to a PENDING, RUNNING or SUCCESS job returns
    /// that job. A submission whose work a success manifest already proves
    /// done is recorded as SUCCESS straight away.
    pub fn enqueue(
        &self,
        tenant_id: &str,
        loan_id: &str,
        request: &Map<String, Value>,
    ) -> Result<EnqueueResponse> {
        let _span = info_span!("enqueue", tenant_id = %tenant_id, loan_id = %loan_id).entered();

        check_component("tenant_id", tenant_id)?;
        check_component("loan_id", loan_id)?;
        let request = JobRequest::from_map(request)?;
        request.validate()?;

        let key = fingerprint(tenant_id, loan_id, &request);

        for _ in 0..ENQUEUE_ATTEMPTS {
            if let Some(entry) = self.keys.lookup(&key)? {
                match self.store.load_by_id(&entry.job_id)? {
                    Some(existing) if existing.status.holds_key() => {
                        info!(job_id = %existing.job_id, status = %existing.status, "Duplicate submission");
                        return Ok(EnqueueResponse::new(&existing.job_id, existing.status));
                    }
                    Some(failed) => {
                        debug!(job_id = %failed.job_id, "Previous attempt failed; creating a new job");
                        self.keys.retire_if_owned(&key, &failed.job_id)?;
                        continue;
                    }
                    None => {
                        let age = Utc::now() - entry.created_at;
                        if age < chrono::Duration::seconds(KEY_PENDING_GRACE_SECS) {
                            // Another submitter is between key claim and record write.
                            return Ok(EnqueueResponse::new(&entry.job_id, JobStatus::Pending));
                        }
                        warn!(job_id = %entry.job_id, "Idempotency key points at a missing job; retiring it");
                        self.keys.retire_if_owned(&key, &entry.job_id)?;
                        continue;
                    }
                }
            }

            let record = self.new_record(tenant_id, loan_id, &request, key.clone());
            match self.keys.try_claim(&key, &record.job_id)? {
                ClaimOutcome::Claimed => {}
                ClaimOutcome::Existing(_) | ClaimOutcome::Vanished => continue,
            }

            if let Err(e) = self.persist_new(&record) {
                if let Err(retire_err) = self.keys.retire_if_owned(&key, &record.job_id) {
                    warn!("Failed to roll back idempotency key: {}", retire_err);
                }
                return Err(e.into());
            }

            info!(job_id = %record.job_id, status = %record.status, "Job enqueued");
            self.publish_status(&record);
            if record.status == JobStatus::Pending {
                self.warn_if_no_worker();
            }
            return Ok(EnqueueResponse::new(&record.job_id, record.status));
        }

        Err(StoreError::Contention {
            key,
            attempts: ENQUEUE_ATTEMPTS,
        }
        .into())
    }

    fn new_record(
        &self,
        tenant_id: &str,
        loan_id: &str,
        request: &JobRequest,
        key: String,
    ) -> JobRecord {
        if !request.is_query() {
            if let Some(run_id) = &request.run_id {
                if let Some(summary) = self.artifacts.success_summary(tenant_id, loan_id, run_id) {
                    info!(run_id = %run_id, "Completion manifest already reports success");
                    return JobRecord::new_completed(
                        tenant_id,
                        loan_id,
                        run_id.clone(),
                        request.to_map(),
                        key,
                        summary,
                    );
                }
            }
        }

        JobRecord::new_pending(
            tenant_id,
            loan_id,
            request.run_id.clone(),
            request.to_map(),
            key,
        )
    }

    fn persist_new(&self, record: &JobRecord) -> std::result::Result<(), StoreError> {
        self.store.save(record)?;
        self.store
            .save_index_entry(&record.job_id, &record.tenant_id, &record.loan_id)
    }

    fn warn_if_no_worker(&self) {
        match self.heartbeat.check(self.config.worker.heartbeat_max_age()) {
            HeartbeatStatus::Missing => {
                warn!("No worker heartbeat found; the job stays PENDING until a worker runs")
            }
            HeartbeatStatus::Stale { age } => warn!(
                "Worker heartbeat is {}s old; the job may stay PENDING",
                age.as_secs()
            ),
            HeartbeatStatus::Fresh { .. } => {}
        }
    }

    /// Current record, read from disk.
    pub fn get(&self, job_id: &str) -> Result<JobView> {
        self.store
            .load_by_id(job_id)?
            .map(JobView::from)
            .ok_or_else(|| LoanJobsError::NotFound(job_id.to_string()))
    }

    /// Newest first, optionally filtered by status.
    pub fn list(&self, limit: Option<usize>, status: Option<JobStatus>) -> Vec<JobView> {
        let limit = limit.unwrap_or(self.config.limits.list_default_limit);

        let mut records: Vec<JobRecord> = self
            .store
            .scan_all_raw(self.config.limits.reload_limit)
            .into_iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        records.into_iter().take(limit).map(JobView::from).collect()
    }

    /// PENDING jobs eligible for the worker loop, oldest first.
    pub fn pending(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.store.list_pending(filter)
    }

    /// Claims, locks and executes one PENDING job, then persists its
    /// terminal state.
    pub fn run_one(&self, job_id: &str) -> Result<RunOneOutcome> {
        let Some(record) = self.store.load_by_id(job_id)? else {
            return Ok(RunOneOutcome::NotFound);
        };
        if record.status != JobStatus::Pending {
            return Ok(RunOneOutcome::NotPending);
        }

        let _span = info_span!("run_one",
            job_id = %record.job_id,
            tenant_id = %record.tenant_id,
            loan_id = %record.loan_id,
        )
        .entered();

        let claimed_at = Utc::now();
        if !self.store.try_claim(&record)? {
            debug!("Claimed by another worker");
            return Ok(RunOneOutcome::NotClaimed);
        }
        let _claim = ClaimGuard {
            store: &self.store,
            record: &record,
        };

        self.clear_abandoned_lock(
            &record.tenant_id,
            &record.loan_id,
            Some((&record.job_id, claimed_at)),
        );

        let lock_guard = match self.lock.acquire(
            &record.tenant_id,
            &record.loan_id,
            &record.job_id,
            self.config.timeouts.lock_wait(),
        ) {
            Ok(guard) => guard,
            Err(LockError::Timeout { waited, .. }) => {
                info!("Loan still busy after {}s; job stays PENDING", waited.as_secs());
                return Ok(RunOneOutcome::LockBusy);
            }
            Err(e) => {
                let mut record = record.clone();
                self.fail_job(&mut record, &e.to_string())?;
                return Ok(RunOneOutcome::Finished(JobStatus::Fail));
            }
        };

        // The claim plus this re-read under the loan lock is the real
        // compare-and-swap: only a record still PENDING here may start.
        let Some(mut record) = self
            .store
            .load(&record.tenant_id, &record.loan_id, &record.job_id)
        else {
            return Ok(RunOneOutcome::NotFound);
        };
        if record.status != JobStatus::Pending {
            return Ok(RunOneOutcome::NotPending);
        }

        let request = match JobRequest::from_map(&record.request).and_then(|r| {
            r.validate()?;
            Ok(r)
        }) {
            Ok(request) => request,
            Err(e) => {
                self.fail_job(&mut record, &format!("Invalid request: {}", e))?;
                return Ok(RunOneOutcome::Finished(JobStatus::Fail));
            }
        };

        record.mark_running();
        self.store.save(&record)?;
        self.publish_status(&record);
        info!("Job running");

        let invocation = PipelineCommand::build(
            &self.config.pipeline,
            &record.job_id,
            &record.tenant_id,
            &record.loan_id,
            &request,
            self.config.timeouts.job_timeout(),
        );
        let outcome = self.execute(&invocation);

        lock_guard.release();

        let status = match outcome {
            Ok(outcome) => self.finalize(&mut record, outcome, invocation.timeout)?,
            Err(e) => {
                self.fail_job(&mut record, &e.to_string())?;
                JobStatus::Fail
            }
        };
        Ok(RunOneOutcome::Finished(status))
    }

    /// Releases a loan lock whose holder can no longer be using it: a
    /// finished job, or a PENDING one that nobody has claimed. `claim` names
    /// a job the caller has just claimed; a lock in that job's name taken
    /// before the claim was left by an earlier, crashed attempt.
    fn clear_abandoned_lock(
        &self,
        tenant_id: &str,
        loan_id: &str,
        claim: Option<(&str, DateTime<Utc>)>,
    ) -> bool {
        let Some(holder) = self.lock.holder(tenant_id, loan_id) else {
            return false;
        };
        let Some(owner) = self.store.load(tenant_id, loan_id, &holder.job_id) else {
            return false;
        };

        let abandoned = match owner.status {
            JobStatus::Running => false,
            JobStatus::Pending => match claim {
                Some((job_id, claimed_at)) if job_id == owner.job_id => {
                    holder.acquired_at < claimed_at
                }
                _ => !self.store.is_claimed(&owner),
            },
            status => status.is_terminal(),
        };
        if !abandoned {
            return false;
        }

        match self.lock.release_abandoned(tenant_id, loan_id, &holder) {
            Ok(released) => released,
            Err(e) => {
                warn!(job_id = %holder.job_id, "Failed to release abandoned loan lock: {}", e);
                false
            }
        }
    }

    /// Sweeps the locks of every loan with PENDING work matching `filter`.
    pub fn clear_abandoned_locks(&self, filter: &JobFilter) -> usize {
        let mut loans: Vec<(String, String)> = self
            .pending(filter)
            .into_iter()
            .map(|r| (r.tenant_id, r.loan_id))
            .collect();
        loans.sort();
        loans.dedup();

        loans
            .iter()
            .filter(|(tenant_id, loan_id)| self.clear_abandoned_lock(tenant_id, loan_id, None))
            .count()
    }

    fn execute(&self, invocation: &Invocation) -> std::result::Result<RunOutcome, RunnerError> {
        match &self.events {
            Some(events) => self
                .runner
                .run(invocation, &events.output_observer(&invocation.job_id)),
            None => self.runner.run(invocation, &NoopObserver),
        }
    }

    /// Applies a finished execution to a RUNNING record and persists it.
    ///
    /// SUCCESS needs exit code 0 and no completion manifest contradicting
    /// it. Query jobs leave no manifest and are judged by exit code alone.
    fn finalize(
        &self,
        record: &mut JobRecord,
        outcome: RunOutcome,
        timeout: Duration,
    ) -> Result<JobStatus> {
        let limits = &self.config.limits;

        if record.run_id.is_none() {
            record.run_id = parse_run_id(&outcome.stdout);
        }
        record.stdout = Some(truncate_tail(&outcome.stdout, limits.stdout_max_bytes));
        record.stderr = Some(truncate_tail(&outcome.stderr, limits.stderr_max_bytes));

        let (tenant_id, loan_id) = (record.tenant_id.clone(), record.loan_id.clone());
        let run_id = record.run_id.clone();

        let (status, result, error) = if outcome.timed_out {
            (
                JobStatus::Fail,
                None,
                Some(format!("Job timed out after {}s", timeout.as_secs())),
            )
        } else if record.is_query() {
            let succeeded = outcome.success();
            let summary =
                self.artifacts
                    .query_summary(&tenant_id, &loan_id, run_id.as_deref(), succeeded);
            if succeeded {
                (JobStatus::Success, Some(summary), None)
            } else {
                (JobStatus::Fail, Some(summary), Some(failure_text(&outcome)))
            }
        } else {
            let manifest = run_id
                .as_deref()
                .and_then(|r| self.artifacts.load(&tenant_id, &loan_id, r));
            let summary = run_id
                .as_deref()
                .and_then(|r| self.artifacts.summary(&tenant_id, &loan_id, r));

            match manifest {
                _ if !outcome.success() => (JobStatus::Fail, summary, Some(failure_text(&outcome))),
                None => (JobStatus::Success, None, None),
                Some(m) if m.is_success() => (JobStatus::Success, summary, None),
                Some(m) => {
                    let reason = m.error.clone().unwrap_or_else(|| {
                        format!(
                            "Completion manifest reports status {}",
                            m.status.as_deref().unwrap_or("<missing>")
                        )
                    });
                    (JobStatus::Fail, summary, Some(reason))
                }
            }
        };

        record.result = result;
        record.error = error.map(|e| truncate_tail(&e, limits.error_max_bytes));
        self.complete(record, status)?;
        Ok(status)
    }

    /// Fails a job that never produced an outcome (lock, request or spawn
    /// errors).
    fn fail_job(&self, record: &mut JobRecord, error: &str) -> Result<()> {
        warn!(job_id = %record.job_id, "Job failed before completion: {}", error);
        record.error = Some(truncate_tail(error, self.config.limits.error_max_bytes));
        self.complete(record, JobStatus::Fail)
    }

    fn complete(&self, record: &mut JobRecord, status: JobStatus) -> Result<()> {
        if !record.finish(status) {
            warn!(
                job_id = %record.job_id,
                "Refusing transition {} -> {}", record.status, status
            );
            return Ok(());
        }
        if status == JobStatus::Fail {
            record.append_phase("FAIL", self.config.limits.stdout_max_bytes);
        }

        self.store.save(record)?;
        info!(job_id = %record.job_id, status = %status, "Job finished");

        if status == JobStatus::Fail {
            self.retire_key(record);
        }
        self.publish_status(record);
        Ok(())
    }

    /// Frees the idempotency key of a failed job so a resubmission creates
    /// a new one.
    fn retire_key(&self, record: &JobRecord) {
        if let Some(key) = &record.job_key {
            if let Err(e) = self.keys.retire_if_owned(key, &record.job_id) {
                warn!(job_id = %record.job_id, "Failed to retire idempotency key: {}", e);
            }
        }
    }

    fn publish_status(&self, record: &JobRecord) {
        if let Some(events) = &self.events {
            events.send(JobEvent::status(
                &record.job_id,
                record.status,
                record.error.as_deref(),
            ));
        }
    }

    /// Startup pass over every RUNNING record.
    ///
    /// Jobs whose execution is still alive stay RUNNING and get a watcher
    /// thread that finalizes them on exit. Dead ones become SUCCESS if a
    /// success manifest exists for their run, FAIL otherwise. PENDING jobs
    /// are only reported; the worker loop picks them up.
    pub fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let _span = info_span!("recover_on_startup").entered();
        let mut report = RecoveryReport::default();

        let records = {
            let mut recover = |record: &mut JobRecord| -> bool {
                if self.runner.is_alive(&record.job_id) {
                    info!(job_id = %record.job_id, "Execution still alive; watching it");
                    report.still_running.push(record.job_id.clone());
                    return false;
                }

                let status = self.recover_dead(record);
                match status {
                    JobStatus::Success => report.recovered_success.push(record.job_id.clone()),
                    _ => report.recovered_fail.push(record.job_id.clone()),
                }
                true
            };
            self.store
                .load_all(self.config.limits.reload_limit, &mut recover)?
        };
        report.loaded = records.len();

        for record in &records {
            if record.status.holds_key() {
                if let Some(key) = &record.job_key {
                    if let Err(e) = self.keys.backfill(key, &record.job_id) {
                        warn!(job_id = %record.job_id, "Failed to back-fill idempotency key: {}", e);
                    }
                }
            }
            match record.status {
                JobStatus::Pending => report.pending.push(record.job_id.clone()),
                JobStatus::Fail if report.recovered_fail.contains(&record.job_id) => {
                    self.retire_key(record);
                    self.publish_status(record);
                }
                JobStatus::Success if report.recovered_success.contains(&record.job_id) => {
                    self.publish_status(record);
                }
                _ => {}
            }
        }

        report.released_locks = self.clear_abandoned_locks(&JobFilter::default());

        for job_id in report.still_running.clone() {
            let service = self.clone();
            let spawned = thread::Builder::new()
                .name(format!("watch-{}", &job_id[..job_id.len().min(8)]))
                .spawn(move || service.watch_detached(&job_id));
            match spawned {
                Ok(handle) => report.watchers.push(handle),
                Err(e) => warn!("Failed to start recovery watcher: {}", e),
            }
        }

        info!(
            loaded = report.loaded,
            recovered_success = report.recovered_success.len(),
            recovered_fail = report.recovered_fail.len(),
            still_running = report.still_running.len(),
            pending = report.pending.len(),
            released_locks = report.released_locks,
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Terminal state for a RUNNING record whose execution is gone. Mutates
    /// the record in place; the caller persists it.
    fn recover_dead(&self, record: &mut JobRecord) -> JobStatus {
        let limits = &self.config.limits;

        if let Err(e) = self
            .lock
            .force_release(&record.tenant_id, &record.loan_id, &record.job_id)
        {
            warn!(job_id = %record.job_id, "Failed to clear loan lock: {}", e);
        }
        if let Err(e) = self.store.release_claim(record) {
            warn!(job_id = %record.job_id, "Failed to clear claim: {}", e);
        }

        // Output captured before the crash, if any survived.
        if let Ok(Some(outcome)) = self.runner.await_detached(&record.job_id, Duration::ZERO) {
            if record.run_id.is_none() {
                record.run_id = parse_run_id(&outcome.stdout);
            }
            record.stdout = Some(truncate_tail(&outcome.stdout, limits.stdout_max_bytes));
            record.stderr = Some(truncate_tail(&outcome.stderr, limits.stderr_max_bytes));
        }

        let summary = match (&record.run_id, record.is_query()) {
            (Some(run_id), false) => {
                self.artifacts
                    .success_summary(&record.tenant_id, &record.loan_id, run_id)
            }
            _ => None,
        };

        let status = match summary {
            Some(summary) => {
                info!(job_id = %record.job_id, "Recovered to SUCCESS from completion manifest");
                record.result = Some(summary);
                record.error = None;
                JobStatus::Success
            }
            None => {
                warn!(job_id = %record.job_id, "Orphaned job marked FAIL");
                record.error = Some(truncate_tail(ORPHANED_ERROR, limits.error_max_bytes));
                JobStatus::Fail
            }
        };

        record.finish(status);
        if status == JobStatus::Fail {
            record.append_phase("FAIL", limits.stdout_max_bytes);
        }
        status
    }

    /// Waits for an execution started by a previous orchestrator and
    /// finalizes it like `run_one` would.
    fn watch_detached(&self, job_id: &str) {
        let _span = info_span!("watch_detached", job_id = %job_id).entered();

        let Some(mut record) = self.store.load_by_id(job_id).ok().flatten() else {
            warn!("Watched job disappeared");
            return;
        };
        if record.status != JobStatus::Running {
            return;
        }

        let timeout = JobRequest::from_map(&record.request)
            .map(|r| r.timeout(self.config.timeouts.job_timeout()))
            .unwrap_or_else(|_| self.config.timeouts.job_timeout());
        let elapsed = record
            .started_at
            .and_then(|s| (Utc::now() - s).to_std().ok())
            .unwrap_or_default();
        let remaining = timeout.saturating_sub(elapsed);

        let outcome = self.runner.await_detached(job_id, remaining);

        if let Err(e) = self
            .lock
            .force_release(&record.tenant_id, &record.loan_id, job_id)
        {
            warn!("Failed to release loan lock: {}", e);
        }
        if let Err(e) = self.store.release_claim(&record) {
            warn!("Failed to clear claim: {}", e);
        }

        let result = match outcome {
            Ok(Some(outcome)) => self.finalize(&mut record, outcome, timeout).map(|_| ()),
            Ok(None) => self.fail_job(&mut record, ORPHANED_ERROR),
            Err(e) => self.fail_job(&mut record, &e.to_string()),
        };
        if let Err(e) = result {
            warn!("Failed to finalize watched job: {}", e);
        }
    }
}

/// Removes a worker claim when `run_one` returns, on every path.
struct ClaimGuard<'a> {
    store: &'a JobStore,
    record: &'a JobRecord,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_claim(self.record) {
            warn!(job_id = %self.record.job_id, "Failed to release claim: {}", e);
        }
    }
}

/// Error text for a failed execution: stderr, else stdout, else the code.
fn failure_text(outcome: &RunOutcome) -> String {
    if !outcome.stderr.trim().is_empty() {
        outcome.stderr.clone()
    } else if !outcome.stdout.trim().is_empty() {
        outcome.stdout.clone()
    } else {
        match outcome.exit_code {
            Some(code) => format!("Exit code {}", code),
            None => "Terminated by signal".to_string(),
        }
    }
}
