//! Idempotency keys: a deterministic fingerprint of (tenant, loan, request)
//! and a durable `key -> job_id` index used to collapse duplicate submits.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::job::JobRequest;
use crate::store::atomic::{create_json_exclusive, move_file, read_json, remove_if_exists};

/// Hex SHA-256 over the canonical JSON of `{tenant_id, loan_id, request}`.
///
/// The request is normalized first and `serde_json` maps are key-ordered,
/// so logically equal submissions produce the same key.
pub fn fingerprint(tenant_id: &str, loan_id: &str, request: &JobRequest) -> String {
    let payload = serde_json::json!({
        "tenant_id": tenant_id,
        "loan_id": loan_id,
        "request": request.to_map(),
    });
    hex::encode(Sha256::digest(payload.to_string().as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyEntry {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller now owns the key.
    Claimed,
    /// Someone else owns it.
    Existing(KeyEntry),
    /// The entry was retired between our create attempt and the read.
    Vanished,
}

/// On-disk `job_key -> job_id` map under `<base>/_meta/job_keys/`.
///
/// Entries are created with link-based exclusive create, so two concurrent
/// submitters can never both believe they own a key. A key bound to a failed
/// job is retired (renamed aside) so the next submit can create a fresh job.
#[derive(Debug, Clone)]
pub struct KeyIndex {
    dir: PathBuf,
}

impl KeyIndex {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            dir: base.as_ref().join("_meta").join("job_keys"),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn lookup(&self, key: &str) -> Result<Option<KeyEntry>, StoreError> {
        match read_json::<KeyEntry>(&self.entry_path(key)) {
            Ok(entry) => Ok(entry),
            Err(StoreError::Corrupt { path, reason }) => {
                // Exclusive create never exposes partial files.
                warn!("Retiring corrupt key entry {}: {}", path.display(), reason);
                self.retire(key, "corrupt")?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn try_claim(&self, key: &str, job_id: &str) -> Result<ClaimOutcome, StoreError> {
        let entry = KeyEntry {
            job_id: job_id.to_string(),
            created_at: Utc::now(),
        };

        if create_json_exclusive(&self.entry_path(key), &entry)? {
            return Ok(ClaimOutcome::Claimed);
        }

        match self.lookup(key)? {
            Some(existing) => Ok(ClaimOutcome::Existing(existing)),
            None => Ok(ClaimOutcome::Vanished),
        }
    }

    /// Moves the entry aside as `<key>.<tag>.<uuid>.retired` and returns
    /// where it went, or `None` if there was no entry.
    pub fn retire(&self, key: &str, tag: &str) -> Result<Option<PathBuf>, StoreError> {
        let from = self.entry_path(key);
        if !from.exists() {
            return Ok(None);
        }
        let to = self.dir.join(format!(
            "{}.{}.{}.retired",
            key,
            tag,
            uuid::Uuid::new_v4().simple()
        ));
        match move_file(&from, &to) {
            Ok(()) => Ok(Some(to)),
            Err(_) if !from.exists() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Retires the entry only if it points at `job_id`. Returns whether it
    /// did.
    ///
    /// The rename comes first and ownership is checked on the moved file,
    /// so an entry claimed by another job in between is never lost: it is
    /// put back.
    pub fn retire_if_owned(&self, key: &str, job_id: &str) -> Result<bool, StoreError> {
        let Some(retired) = self.retire(key, job_id)? else {
            return Ok(false);
        };

        let moved = match read_json::<KeyEntry>(&retired) {
            Ok(Some(entry)) => entry,
            // Unreadable entries stay retired.
            Ok(None) | Err(_) => return Ok(true),
        };
        if moved.job_id == job_id {
            return Ok(true);
        }

        if create_json_exclusive(&self.entry_path(key), &moved)? {
            remove_if_exists(&retired)?;
        } else {
            warn!(
                "Key {} was claimed again while restoring job {}; keeping the newer entry",
                key, moved.job_id
            );
        }
        Ok(false)
    }

    /// Recreates a missing entry for a live record found on disk.
    pub fn backfill(&self, key: &str, job_id: &str) -> Result<(), StoreError> {
        if let ClaimOutcome::Claimed = self.try_claim(key, job_id)? {
            info!("Back-filled idempotency key for job {}", job_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(run_id: &str) -> JobRequest {
        JobRequest {
            run_id: Some(run_id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("t1", "L1", &request("r1"));
        let b = fingerprint("t1", "L1", &request("r1"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() {
        let base = fingerprint("t1", "L1", &request("r1"));
        assert_ne!(base, fingerprint("t2", "L1", &request("r1")));
        assert_ne!(base, fingerprint("t1", "L2", &request("r1")));
        assert_ne!(base, fingerprint("t1", "L1", &request("r2")));
    }

    #[test]
    fn test_claim_then_existing() {
        let temp_dir = TempDir::new().unwrap();
        let index = KeyIndex::new(temp_dir.path());

        assert_eq!(index.try_claim("k1", "job-a").unwrap(), ClaimOutcome::Claimed);
        match index.try_claim("k1", "job-b").unwrap() {
            ClaimOutcome::Existing(entry) => assert_eq!(entry.job_id, "job-a"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(index.lookup("k1").unwrap().unwrap().job_id, "job-a");
    }

    #[test]
    fn test_retire_frees_key() {
        let temp_dir = TempDir::new().unwrap();
        let index = KeyIndex::new(temp_dir.path());
        index.try_claim("k1", "job-a").unwrap();

        assert!(!index.retire_if_owned("k1", "job-other").unwrap());
        assert!(index.lookup("k1").unwrap().is_some());

        assert!(index.retire_if_owned("k1", "job-a").unwrap());
        assert!(index.lookup("k1").unwrap().is_none());
        assert_eq!(index.try_claim("k1", "job-b").unwrap(), ClaimOutcome::Claimed);

        // Retiring a missing entry is fine.
        assert!(index.retire("nope", "x").unwrap().is_none());
    }

    fn retired_files(index: &KeyIndex) -> usize {
        std::fs::read_dir(&index.dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".retired"))
            .count()
    }

    #[test]
    fn test_late_retire_keeps_successor_entry() {
        let temp_dir = TempDir::new().unwrap();
        let index = KeyIndex::new(temp_dir.path());

        // Job F failed; a resubmission retired its entry and claimed N.
        index.try_claim("k1", "job-f").unwrap();
        assert!(index.retire_if_owned("k1", "job-f").unwrap());
        assert_eq!(index.try_claim("k1", "job-n").unwrap(), ClaimOutcome::Claimed);
        let live = index.lookup("k1").unwrap().unwrap();

        // F's worker retires late.
        assert!(!index.retire_if_owned("k1", "job-f").unwrap());
        assert_eq!(index.lookup("k1").unwrap().unwrap(), live);
        assert_eq!(retired_files(&index), 1);

        // The key still deduplicates onto N.
        match index.try_claim("k1", "job-x").unwrap() {
            ClaimOutcome::Existing(entry) => assert_eq!(entry.job_id, "job-n"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_entry_is_retired() {
        let temp_dir = TempDir::new().unwrap();
        let index = KeyIndex::new(temp_dir.path());
        std::fs::create_dir_all(&index.dir).unwrap();
        std::fs::write(index.entry_path("k1"), b"garbage").unwrap();

        assert!(index.lookup("k1").unwrap().is_none());
        assert_eq!(index.try_claim("k1", "job-a").unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_backfill_keeps_existing_owner() {
        let temp_dir = TempDir::new().unwrap();
        let index = KeyIndex::new(temp_dir.path());
        index.backfill("k1", "job-a").unwrap();
        index.backfill("k1", "job-b").unwrap();
        assert_eq!(index.lookup("k1").unwrap().unwrap().job_id, "job-a");
    }
}
