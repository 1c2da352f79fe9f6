use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::atomic::{read_json, write_json_atomic};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub heartbeat_utc: DateTime<Utc>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Missing,
    Stale { age: Duration },
    Fresh { age: Duration },
}

impl HeartbeatStatus {
    pub fn is_fresh(&self) -> bool {
        matches!(self, HeartbeatStatus::Fresh { .. })
    }
}

/// Liveness stamp at `<base>/_meta/worker_heartbeat.json`, rewritten on a
/// fixed interval while a worker runs. A missing or old stamp means nothing
/// is draining the queue.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    path: PathBuf,
}

impl Heartbeat {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            path: base.as_ref().join("_meta").join("worker_heartbeat.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn beat(&self) -> Result<(), StoreError> {
        let record = HeartbeatRecord {
            heartbeat_utc: Utc::now(),
            pid: Some(std::process::id()),
            hostname: nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok()),
        };
        write_json_atomic(&self.path, &record)
    }

    /// Unreadable stamps count as missing.
    pub fn read(&self) -> Option<HeartbeatRecord> {
        read_json(&self.path).ok().flatten()
    }

    pub fn check(&self, max_age: Duration) -> HeartbeatStatus {
        let Some(record) = self.read() else {
            return HeartbeatStatus::Missing;
        };

        let age = (Utc::now() - record.heartbeat_utc)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            HeartbeatStatus::Stale { age }
        } else {
            HeartbeatStatus::Fresh { age }
        }
    }
}

/// Rewrites `heartbeat` every `interval` until `stop` disconnects.
pub(crate) fn beat_until_closed(heartbeat: &Heartbeat, interval: Duration, stop: &Receiver<()>) {
    loop {
        if let Err(e) = heartbeat.beat() {
            warn!("Failed to write heartbeat: {}", e);
        }
        match stop.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Heartbeat thread stopped");
}

/// Background thread keeping the heartbeat fresh, even while a single job
/// runs longer than the heartbeat's max age. Stops when dropped.
pub struct HeartbeatThread {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatThread {
    pub fn start(heartbeat: Heartbeat, interval: Duration) -> Self {
        let (stop, stop_rx) = bounded::<()>(0);
        let handle = thread::spawn(move || beat_until_closed(&heartbeat, interval, &stop_rx));
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatThread {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_heartbeat() {
        let temp_dir = TempDir::new().unwrap();
        let heartbeat = Heartbeat::new(temp_dir.path());
        assert_eq!(heartbeat.check(Duration::from_secs(300)), HeartbeatStatus::Missing);
    }

    #[test]
    fn test_fresh_after_beat() {
        let temp_dir = TempDir::new().unwrap();
        let heartbeat = Heartbeat::new(temp_dir.path());
        heartbeat.beat().unwrap();

        assert!(heartbeat.check(Duration::from_secs(300)).is_fresh());
        let record = heartbeat.read().unwrap();
        assert_eq!(record.pid, Some(std::process::id()));
        assert!(heartbeat.path().ends_with("_meta/worker_heartbeat.json"));
    }

    #[test]
    fn test_stale_heartbeat() {
        let temp_dir = TempDir::new().unwrap();
        let heartbeat = Heartbeat::new(temp_dir.path());
        let old = HeartbeatRecord {
            heartbeat_utc: Utc::now() - chrono::Duration::seconds(600),
            pid: None,
            hostname: None,
        };
        write_json_atomic(heartbeat.path(), &old).unwrap();

        match heartbeat.check(Duration::from_secs(300)) {
            HeartbeatStatus::Stale { age } => assert!(age >= Duration::from_secs(600)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_legacy_heartbeat_without_pid() {
        let temp_dir = TempDir::new().unwrap();
        let heartbeat = Heartbeat::new(temp_dir.path());
        std::fs::create_dir_all(heartbeat.path().parent().unwrap()).unwrap();
        std::fs::write(
            heartbeat.path(),
            format!("{{\"heartbeat_utc\": \"{}\"}}", Utc::now().to_rfc3339()),
        )
        .unwrap();
        assert!(heartbeat.check(Duration::from_secs(300)).is_fresh());
    }

    #[test]
    fn test_heartbeat_thread_keeps_beating() {
        let temp_dir = TempDir::new().unwrap();
        let heartbeat = Heartbeat::new(temp_dir.path());
        let beater = HeartbeatThread::start(heartbeat.clone(), Duration::from_millis(20));

        thread::sleep(Duration::from_millis(50));
        let first = heartbeat.read().unwrap().heartbeat_utc;
        thread::sleep(Duration::from_millis(100));
        let second = heartbeat.read().unwrap().heartbeat_utc;
        assert!(second > first);

        beater.stop();
        let last = heartbeat.read().unwrap().heartbeat_utc;
        thread::sleep(Duration::from_millis(60));
        assert_eq!(heartbeat.read().unwrap().heartbeat_utc, last);
    }
}
