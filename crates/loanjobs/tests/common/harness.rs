//! Isolated job directory for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use loanjobs::artifact::ArtifactLocator;
use loanjobs::job::JobRecord;
use loanjobs::lock::ResourceLock;
use loanjobs::runner::PipelineRunner;
use loanjobs::{JobService, JobStatus, JobStore, JobsConfig};

pub struct TestHarness {
    temp_dir: TempDir,
    pub config: JobsConfig,
}

impl TestHarness {
    /// Short timeouts so lock waits and polling finish quickly.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = JobsConfig::with_base_path(temp_dir.path());
        config.timeouts.job_timeout_secs = 30;
        config.timeouts.lock_wait_secs = 10;
        config.timeouts.lock_retry_millis = 20;
        config.timeouts.kill_grace_secs = 1;
        config.worker.poll_interval_millis = 50;

        Self { temp_dir, config }
    }

    pub fn base(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn service(&self, runner: Arc<dyn PipelineRunner>) -> JobService {
        JobService::new(self.config.clone(), runner)
    }

    pub fn store(&self) -> JobStore {
        JobStore::new(self.base())
    }

    pub fn lock(&self) -> ResourceLock {
        ResourceLock::new(self.base(), Duration::from_millis(20))
    }

    pub fn artifacts(&self) -> ArtifactLocator {
        ArtifactLocator::new(self.base())
    }

    pub fn write_manifest(&self, tenant_id: &str, loan_id: &str, run_id: &str, status: &str) -> PathBuf {
        write_manifest(self.base(), tenant_id, loan_id, run_id, status)
    }

    pub fn record(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> JobRecord {
        self.store()
            .load(tenant_id, loan_id, job_id)
            .expect("record should exist")
    }

    /// Writes a record straight to disk, bypassing enqueue.
    pub fn insert(&self, record: &JobRecord) {
        let store = self.store();
        store.save(record).expect("Failed to save record");
        store
            .save_index_entry(&record.job_id, &record.tenant_id, &record.loan_id)
            .expect("Failed to save index entry");
    }

    pub fn key_dir(&self) -> PathBuf {
        self.base().join("_meta").join("job_keys")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.base().join("_meta").join("job_index")
    }
}

/// A manifest the way the pipeline writes it.
pub fn write_manifest(base: &Path, tenant_id: &str, loan_id: &str, run_id: &str, status: &str) -> PathBuf {
    let path = ArtifactLocator::new(base).manifest_path(tenant_id, loan_id, run_id);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let manifest = json!({
        "status": status,
        "run_id": run_id,
        "retrieval_pack_sha256": "ab12",
        "error": if status == "SUCCESS" { Value::Null } else { json!("step 3 exploded") },
        "generated_at_utc": "2026-01-01T00:00:00Z",
    });
    std::fs::write(&path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
    path
}

pub fn request(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("request must be an object, got {}", other),
    }
}

/// PENDING record written straight to disk, bypassing submission checks.
pub fn pending_record(tenant_id: &str, loan_id: &str, body: Value) -> JobRecord {
    let body = request(body);
    let run_id = body.get("run_id").and_then(Value::as_str).map(str::to_string);
    JobRecord::new_pending(
        tenant_id,
        loan_id,
        run_id,
        body,
        format!("key-{}", uuid::Uuid::new_v4()),
    )
}

pub fn running_record(tenant_id: &str, loan_id: &str, run_id: Option<&str>) -> JobRecord {
    let mut body = json!({ "skip_intake": true });
    if let Some(run_id) = run_id {
        body["run_id"] = json!(run_id);
    }
    let mut record = JobRecord::new_pending(
        tenant_id,
        loan_id,
        run_id.map(str::to_string),
        request(body),
        format!("key-{}", uuid::Uuid::new_v4()),
    );
    assert!(record.mark_running());
    record
}

/// Polls `get` until the job reaches `status` or `timeout` passes.
pub fn wait_for_status(service: &JobService, job_id: &str, status: JobStatus, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(view) = service.get(job_id) {
            if view.status == status {
                return true;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}
