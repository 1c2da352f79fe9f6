//! Job event broadcaster for live status and output streaming.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::job::JobStatus;
use crate::runner::OutputObserver;

/// Event published while jobs move through the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job's persisted status changed.
    Status {
        job_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// One stdout line from a running pipeline.
    Output {
        job_id: String,
        line: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn status(job_id: &str, status: JobStatus, error: Option<&str>) -> Self {
        JobEvent::Status {
            job_id: job_id.to_string(),
            status,
            error: error.map(|e| e.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn output(job_id: &str, line: &str) -> Self {
        JobEvent::Output {
            job_id: job_id.to_string(),
            line: line.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Status { job_id, .. } | JobEvent::Output { job_id, .. } => job_id,
        }
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Observer that forwards a job's stdout lines as [`JobEvent::Output`].
    pub fn output_observer(&self, job_id: &str) -> JobOutputForwarder {
        JobOutputForwarder {
            job_id: job_id.to_string(),
            broadcaster: self.clone(),
        }
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct JobOutputForwarder {
    job_id: String,
    broadcaster: JobEventBroadcaster,
}

impl OutputObserver for JobOutputForwarder {
    fn on_stdout_line(&self, line: &str) {
        self.broadcaster.send(JobEvent::output(&self.job_id, line));
    }
}

/// Logs every event on a dedicated thread: status changes at info, pipeline
/// output at debug. Ends once every sender is dropped and returns how many
/// events it logged.
pub fn spawn_event_logger(events: &JobEventBroadcaster) -> std::io::Result<JoinHandle<u64>> {
    let mut rx = events.subscribe();
    thread::Builder::new()
        .name("job-events".to_string())
        .spawn(move || {
            let mut logged = 0;
            loop {
                match rx.blocking_recv() {
                    Ok(event) => {
                        log_event(&event);
                        logged += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event log fell behind; skipped {} events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            logged
        })
}

fn log_event(event: &JobEvent) {
    match event {
        JobEvent::Status {
            job_id,
            status,
            error: Some(error),
            ..
        } => info!(job_id = %job_id, status = %status, "Job status changed: {}", error),
        JobEvent::Status { job_id, status, .. } => {
            info!(job_id = %job_id, status = %status, "Job status changed")
        }
        JobEvent::Output { job_id, line, .. } => debug!(job_id = %job_id, "{}", line),
    }
}
