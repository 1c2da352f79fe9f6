//! Per-loan mutual exclusion backed by an exclusively created lock file.
//!
//! The lock key is exactly (tenant_id, loan_id) and no code path ever holds
//! two of them, so there is no lock ordering to get wrong.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::LockError;
use crate::store::atomic::{create_json_exclusive, read_json, remove_if_exists};

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub job_id: String,
    #[serde(alias = "created_at_utc")]
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ResourceLock {
    base: PathBuf,
    retry: Duration,
}

impl ResourceLock {
    pub fn new<P: AsRef<Path>>(base: P, retry: Duration) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            retry: retry.max(Duration::from_millis(1)),
        }
    }

    pub fn lock_path(&self, tenant_id: &str, loan_id: &str) -> PathBuf {
        self.base
            .join("tenants")
            .join(tenant_id)
            .join("loans")
            .join(loan_id)
            .join("_meta")
            .join("locks")
            .join("loan.lock")
    }

    /// Single attempt.
    pub fn try_acquire(
        &self,
        tenant_id: &str,
        loan_id: &str,
        job_id: &str,
    ) -> Result<Option<ResourceLockGuard>, LockError> {
        let path = self.lock_path(tenant_id, loan_id);
        let holder = LockHolder {
            job_id: job_id.to_string(),
            acquired_at: Utc::now(),
            pid: Some(std::process::id()),
        };

        if create_json_exclusive(&path, &holder)? {
            debug!("Acquired loan lock {}/{} for job {}", tenant_id, loan_id, job_id);
            Ok(Some(ResourceLockGuard {
                path,
                job_id: job_id.to_string(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Blocks until the lock is free or `max_wait` has elapsed, polling at
    /// the configured retry interval.
    pub fn acquire(
        &self,
        tenant_id: &str,
        loan_id: &str,
        job_id: &str,
        max_wait: Duration,
    ) -> Result<ResourceLockGuard, LockError> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(guard) = self.try_acquire(tenant_id, loan_id, job_id)? {
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(LockError::Timeout {
                    tenant_id: tenant_id.to_string(),
                    loan_id: loan_id.to_string(),
                    waited,
                });
            }

            if !announced {
                let held_by = self
                    .holder(tenant_id, loan_id)
                    .map(|h| h.job_id)
                    .unwrap_or_else(|| "<unknown>".to_string());
                info!(
                    "Job {} waiting for loan lock {}/{} (held by {})",
                    job_id, tenant_id, loan_id, held_by
                );
                announced = true;
            }

            thread::sleep(self.retry.min(max_wait - waited));
        }
    }

    pub fn holder(&self, tenant_id: &str, loan_id: &str) -> Option<LockHolder> {
        read_json(&self.lock_path(tenant_id, loan_id)).ok().flatten()
    }

    /// Removes a lock left behind by `job_id` (used by recovery once that
    /// job is known dead). Returns whether a lock was removed.
    pub fn force_release(
        &self,
        tenant_id: &str,
        loan_id: &str,
        job_id: &str,
    ) -> Result<bool, LockError> {
        match self.holder(tenant_id, loan_id) {
            Some(holder) if holder.job_id == job_id => {
                warn!(
                    "Releasing loan lock {}/{} left by job {}",
                    tenant_id, loan_id, job_id
                );
                remove_if_exists(&self.lock_path(tenant_id, loan_id))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes the lock only while it still records exactly `holder`, so a
    /// lock taken since `holder` was read is left alone.
    pub fn release_abandoned(
        &self,
        tenant_id: &str,
        loan_id: &str,
        holder: &LockHolder,
    ) -> Result<bool, LockError> {
        if self.holder(tenant_id, loan_id).as_ref() != Some(holder) {
            return Ok(false);
        }
        warn!(
            "Releasing abandoned loan lock {}/{} held by job {} since {}",
            tenant_id, loan_id, holder.job_id, holder.acquired_at
        );
        remove_if_exists(&self.lock_path(tenant_id, loan_id))?;
        Ok(true)
    }
}

/// Held loan lock; released on drop.
#[derive(Debug)]
pub struct ResourceLockGuard {
    path: PathBuf,
    job_id: String,
    released: bool,
}

impl ResourceLockGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Never delete a lock that has since been taken over.
        let owned = read_json::<LockHolder>(&self.path)
            .ok()
            .flatten()
            .map_or(false, |h| h.job_id == self.job_id);
        if !owned {
            warn!(
                "Loan lock {} no longer owned by job {}; leaving it",
                self.path.display(),
                self.job_id
            );
            return;
        }

        if let Err(e) = remove_if_exists(&self.path) {
            warn!("Failed to release loan lock: {}", e);
        } else {
            debug!("Released loan lock for job {}", self.job_id);
        }
    }
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn lock(temp_dir: &TempDir) -> ResourceLock {
        ResourceLock::new(temp_dir.path(), Duration::from_millis(10))
    }

    #[test]
    fn test_acquire_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock(&temp_dir);

        let guard = lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap();
        assert_eq!(guard.job_id(), "job-a");
        assert_eq!(lock.holder("t1", "L1").unwrap().job_id, "job-a");
        assert!(lock.try_acquire("t1", "L1", "job-b").unwrap().is_none());

        guard.release();
        assert!(lock.holder("t1", "L1").is_none());
        assert!(lock.try_acquire("t1", "L1", "job-b").unwrap().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock(&temp_dir);
        {
            let _guard = lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap();
        }
        assert!(!lock.lock_path("t1", "L1").exists());
    }

    #[test]
    fn test_timeout_when_busy() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock(&temp_dir);
        let _held = lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap();

        let err = lock
            .acquire("t1", "L1", "job-b", Duration::from_millis(50))
            .unwrap_err();
        match err {
            LockError::Timeout { waited, .. } => assert!(waited >= Duration::from_millis(50)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_different_loans_do_not_contend() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock(&temp_dir);
        let _a = lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap();
        let _b = lock.acquire("t1", "L2", "job-b", Duration::ZERO).unwrap();
        let _c = lock.acquire("t2", "L1", "job-c", Duration::ZERO).unwrap();
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = Arc::new(lock(&temp_dir));
        let guard = lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.acquire("t1", "L1", "job-b", Duration::from_secs(5))
                    .map(|g| g.job_id().to_string())
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert_eq!(waiter.join().unwrap().unwrap(), "job-b");
    }

    #[test]
    fn test_serializes_same_loan() {
        let temp_dir = TempDir::new().unwrap();
        let lock = Arc::new(lock(&temp_dir));
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    let _guard = lock
                        .acquire("t1", "L1", &format!("job-{}", i), Duration::from_secs(10))
                        .unwrap();
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    inside.store(false, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_force_release_only_for_owner() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock(&temp_dir);
        let guard = lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap();
        std::mem::forget(guard);

        assert!(!lock.force_release("t1", "L1", "job-b").unwrap());
        assert!(lock.force_release("t1", "L1", "job-a").unwrap());
        assert!(lock.holder("t1", "L1").is_none());
    }

    #[test]
    fn test_stale_guard_does_not_remove_new_owner() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock(&temp_dir);
        let stale = lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap();
        lock.force_release("t1", "L1", "job-a").unwrap();
        let _fresh = lock.acquire("t1", "L1", "job-b", Duration::ZERO).unwrap();

        drop(stale);
        assert_eq!(lock.holder("t1", "L1").unwrap().job_id, "job-b");
    }

    #[test]
    fn test_release_abandoned_requires_same_holder() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock(&temp_dir);
        std::mem::forget(lock.acquire("t1", "L1", "job-a", Duration::ZERO).unwrap());
        let seen = lock.holder("t1", "L1").unwrap();

        // Released and re-taken since it was read.
        lock.force_release("t1", "L1", "job-a").unwrap();
        std::mem::forget(lock.acquire("t1", "L1", "job-b", Duration::ZERO).unwrap());
        assert!(!lock.release_abandoned("t1", "L1", &seen).unwrap());
        assert_eq!(lock.holder("t1", "L1").unwrap().job_id, "job-b");

        let current = lock.holder("t1", "L1").unwrap();
        assert!(lock.release_abandoned("t1", "L1", &current).unwrap());
        assert!(lock.holder("t1", "L1").is_none());
    }
}
