use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::{DirEntry, WalkDir};

use super::atomic::{create_marker, read_json, remove_if_exists, write_json_atomic};
use crate::error::StoreError;
use crate::job::{JobRecord, JobStatus};
use crate::sanitize::is_safe_component;

/// Secondary index entry: `job_id -> (tenant_id, loan_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub tenant_id: String,
    pub loan_id: String,
}

/// Restricts scans to one tenant and/or loan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    pub loan_id: Option<String>,
}

impl JobFilter {
    fn matches(&self, tenant_id: &str, loan_id: &str) -> bool {
        self.tenant_id.as_deref().map_or(true, |t| t == tenant_id)
            && self.loan_id.as_deref().map_or(true, |l| l == loan_id)
    }
}

/// A record file found by a scan, before it is parsed.
#[derive(Debug, Clone)]
struct RecordFile {
    path: PathBuf,
    tenant_id: String,
    loan_id: String,
    job_id: String,
    modified: SystemTime,
}

/// JSON-on-disk job store.
///
/// Layout under `base`:
/// - `tenants/<t>/loans/<l>/_meta/jobs/<job_id>.json` (record)
/// - `tenants/<t>/loans/<l>/_meta/jobs/<job_id>.claim` (worker claim)
/// - `_meta/job_index/<job_id>.json` (index entry)
///
/// There is no cache: every read goes to disk.
#[derive(Debug, Clone)]
pub struct JobStore {
    base: PathBuf,
}

impl JobStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn loan_dir(&self, tenant_id: &str, loan_id: &str) -> PathBuf {
        self.base
            .join("tenants")
            .join(tenant_id)
            .join("loans")
            .join(loan_id)
    }

    fn jobs_dir(&self, tenant_id: &str, loan_id: &str) -> PathBuf {
        self.loan_dir(tenant_id, loan_id).join("_meta").join("jobs")
    }

    pub fn record_path(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> PathBuf {
        self.jobs_dir(tenant_id, loan_id)
            .join(format!("{}.json", job_id))
    }

    fn claim_path(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> PathBuf {
        self.jobs_dir(tenant_id, loan_id)
            .join(format!("{}.claim", job_id))
    }

    fn index_path(&self, job_id: &str) -> PathBuf {
        self.base
            .join("_meta")
            .join("job_index")
            .join(format!("{}.json", job_id))
    }

    pub fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.tenant_id, &record.loan_id, &record.job_id);
        write_json_atomic(&path, record)
    }

    /// Loads one record. Missing, unreadable or mismatched files are logged
    /// and reported as absent.
    pub fn load(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> Option<JobRecord> {
        let path = self.record_path(tenant_id, loan_id, job_id);
        self.load_path(&path, job_id)
    }

    fn load_path(&self, path: &Path, job_id: &str) -> Option<JobRecord> {
        let mut value: Value = match read_json(path) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!("Skipping unreadable job record: {}", e);
                return None;
            }
        };

        if let Value::Object(map) = &mut value {
            if !map.contains_key("created_at") && !map.contains_key("created_at_utc") {
                let created = modified_time(path).unwrap_or_else(SystemTime::now);
                let created: DateTime<Utc> = created.into();
                map.insert(
                    "created_at".to_string(),
                    Value::String(created.to_rfc3339()),
                );
            }
        }

        let record: JobRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping corrupt job record {}: {}", path.display(), e);
                return None;
            }
        };

        if record.job_id != job_id {
            warn!(
                "Skipping job record {}: contains job_id '{}'",
                path.display(),
                record.job_id
            );
            return None;
        }

        Some(record)
    }

    pub fn save_index_entry(
        &self,
        job_id: &str,
        tenant_id: &str,
        loan_id: &str,
    ) -> Result<(), StoreError> {
        let entry = IndexEntry {
            tenant_id: tenant_id.to_string(),
            loan_id: loan_id.to_string(),
        };
        write_json_atomic(&self.index_path(job_id), &entry)
    }

    pub fn load_index_entry(&self, job_id: &str) -> Option<IndexEntry> {
        if !is_safe_component(job_id) {
            return None;
        }
        match read_json::<IndexEntry>(&self.index_path(job_id)) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring unreadable index entry for {}: {}", job_id, e);
                None
            }
        }
    }

    /// Resolves a job by id alone: index first, then a directory scan for
    /// records that predate the index (back-filling the entry).
    pub fn load_by_id(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        if !is_safe_component(job_id) {
            return Ok(None);
        }

        if let Some(entry) = self.load_index_entry(job_id) {
            return Ok(self.load(&entry.tenant_id, &entry.loan_id, job_id));
        }

        let found = self
            .record_files(&JobFilter::default())
            .into_iter()
            .find(|f| f.job_id == job_id);

        let Some(file) = found else {
            return Ok(None);
        };

        let record = self.load_path(&file.path, job_id);
        if record.is_some() {
            info!("Back-filling index entry for job {}", job_id);
            self.save_index_entry(job_id, &file.tenant_id, &file.loan_id)?;
        }
        Ok(record)
    }

    /// Full scan, most recently modified first, without any recovery.
    pub fn scan_all_raw(&self, limit: usize) -> Vec<JobRecord> {
        self.scan(&JobFilter::default(), limit)
    }

    fn scan(&self, filter: &JobFilter, limit: usize) -> Vec<JobRecord> {
        let mut files = self.record_files(filter);
        files.sort_by(|a, b| b.modified.cmp(&a.modified));

        files
            .iter()
            .take(limit)
            .filter_map(|f| self.load_path(&f.path, &f.job_id))
            .collect()
    }

    /// Full scan that back-fills missing index entries and hands every
    /// RUNNING record to `recover`. Records for which `recover` returns true
    /// are persisted.
    ///
    /// Only startup recovery should call this.
    pub fn load_all(
        &self,
        limit: usize,
        recover: &mut dyn FnMut(&mut JobRecord) -> bool,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = self.scan_all_raw(limit);

        for record in &mut records {
            if self.load_index_entry(&record.job_id).is_none() {
                info!("Back-filling index entry for job {}", record.job_id);
                self.save_index_entry(&record.job_id, &record.tenant_id, &record.loan_id)?;
            }

            if record.status == JobStatus::Running && recover(record) {
                self.save(record)?;
            }
        }

        Ok(records)
    }

    /// PENDING records matching `filter`, oldest first.
    pub fn list_pending(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let mut pending: Vec<JobRecord> = self
            .scan(filter, usize::MAX)
            .into_iter()
            .filter(|r| r.status == JobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Exclusive claim on a job for one worker. Returns false if another
    /// worker holds it.
    pub fn try_claim(&self, record: &JobRecord) -> Result<bool, StoreError> {
        let path = self.claim_path(&record.tenant_id, &record.loan_id, &record.job_id);
        let stamp = serde_json::json!({
            "claimed_at": Utc::now().to_rfc3339(),
            "pid": std::process::id(),
        });
        create_marker(&path, stamp.to_string().as_bytes())
    }

    pub fn is_claimed(&self, record: &JobRecord) -> bool {
        self.claim_path(&record.tenant_id, &record.loan_id, &record.job_id)
            .exists()
    }

    pub fn release_claim(&self, record: &JobRecord) -> Result<(), StoreError> {
        let path = self.claim_path(&record.tenant_id, &record.loan_id, &record.job_id);
        remove_if_exists(&path)
    }

    /// Removes claims older than `max_age` whose job is still PENDING, i.e.
    /// the claimant died before it could start the job.
    pub fn clear_stale_claims(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut cleared = 0;

        for claim in self.claim_files() {
            let age = modified_time(&claim.path)
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }

            let still_pending = self
                .load(&claim.tenant_id, &claim.loan_id, &claim.job_id)
                .map_or(false, |r| r.status == JobStatus::Pending);
            if !still_pending {
                continue;
            }

            match remove_if_exists(&claim.path) {
                Ok(()) => {
                    warn!(
                        "Cleared stale claim for job {} (age {}s)",
                        claim.job_id,
                        age.as_secs()
                    );
                    cleared += 1;
                }
                Err(e) => warn!("Could not clear stale claim: {}", e),
            }
        }

        cleared
    }

    fn record_files(&self, filter: &JobFilter) -> Vec<RecordFile> {
        self.walk_jobs_dirs(filter, "json")
    }

    fn claim_files(&self) -> Vec<RecordFile> {
        self.walk_jobs_dirs(&JobFilter::default(), "claim")
    }

    /// Walks `tenants/*/loans/*/_meta/jobs/*.<extension>`, pruning every
    /// other subtree (run directories can be large).
    fn walk_jobs_dirs(&self, filter: &JobFilter, extension: &str) -> Vec<RecordFile> {
        let tenants = self.base.join("tenants");
        if !tenants.is_dir() {
            return Vec::new();
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&tenants)
            .min_depth(1)
            .max_depth(6)
            .into_iter()
            .filter_entry(|e| on_jobs_path(e, filter))
            .filter_map(|e| e.ok())
        {
            if entry.depth() != 6 || !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }

            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_safe_component(job_id) {
                continue;
            }

            let Some((tenant_id, loan_id)) = owner_of(path) else {
                continue;
            };

            files.push(RecordFile {
                path: path.to_path_buf(),
                tenant_id,
                loan_id,
                job_id: job_id.to_string(),
                modified: entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        debug!("Scanned {} .{} files under {}", files.len(), extension, tenants.display());
        files
    }
}

/// Directory-shape predicate for the walk below `tenants/`.
fn on_jobs_path(entry: &DirEntry, filter: &JobFilter) -> bool {
    let name = entry.file_name().to_str().unwrap_or("");
    match entry.depth() {
        1 => filter.tenant_id.as_deref().map_or(true, |t| t == name),
        2 => name == "loans",
        3 => filter.loan_id.as_deref().map_or(true, |l| l == name),
        4 => name == "_meta",
        5 => name == "jobs",
        _ => !name.starts_with('.'),
    }
}

/// `.../<tenant>/loans/<loan>/_meta/jobs/<file>` -> (tenant, loan)
fn owner_of(path: &Path) -> Option<(String, String)> {
    let loan_dir = path.parent()?.parent()?.parent()?;
    let loan_id = loan_dir.file_name()?.to_str()?;
    let tenant_id = loan_dir.parent()?.parent()?.file_name()?.to_str()?;
    Some((tenant_id.to_string(), loan_id.to_string()))
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}
