use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use super::heartbeat::beat_until_closed;
use crate::job::JobStatus;
use crate::service::{JobService, RunOneOutcome};
use crate::store::JobFilter;

/// What one poll cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub succeeded: usize,
    pub failed: usize,
    /// Left PENDING because their loan stayed locked.
    pub busy: usize,
}

impl CycleStats {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Clears stale claims and abandoned loan locks, then tries every eligible
/// PENDING job once.
///
/// Jobs another worker claimed in the meantime are skipped silently; errors
/// on one job never stop the cycle.
pub fn run_one_cycle(service: &JobService, filter: &JobFilter) -> CycleStats {
    let mut stats = CycleStats::default();

    let cleared = service
        .store()
        .clear_stale_claims(service.config().worker.claim_stale());
    if cleared > 0 {
        info!("Cleared {} stale claims", cleared);
    }
    let released = service.clear_abandoned_locks(filter);
    if released > 0 {
        info!("Released {} abandoned loan locks", released);
    }

    for record in service.pending(filter) {
        match service.run_one(&record.job_id) {
            Ok(RunOneOutcome::Finished(JobStatus::Success)) => stats.succeeded += 1,
            Ok(RunOneOutcome::Finished(_)) => stats.failed += 1,
            Ok(RunOneOutcome::LockBusy) => stats.busy += 1,
            Ok(other) => debug!("Skipped job {}: {:?}", record.job_id, other),
            Err(e) => error!("Job {} could not be processed: {}", record.job_id, e),
        }
    }

    stats
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub filter: JobFilter,
}

impl WorkerOptions {
    pub fn from_service(service: &JobService) -> Self {
        let worker = &service.config().worker;
        Self {
            concurrency: worker.concurrency,
            poll_interval: worker.poll_interval(),
            heartbeat_interval: worker.heartbeat_interval(),
            filter: JobFilter::default(),
        }
    }
}

/// Long-running pollers draining PENDING jobs from disk.
///
/// Each thread runs a cycle, then sleeps for the poll interval. A separate
/// thread rewrites the heartbeat on its own interval, so it stays fresh
/// while a long job runs. `shutdown` wakes sleepers at once; a job already
/// executing is allowed to finish.
pub struct WorkerLoop {
    workers: Vec<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Mutex<Option<Sender<()>>>,
}

impl WorkerLoop {
    pub fn start(service: JobService, options: WorkerOptions) -> Self {
        let worker_count = options.concurrency.max(1);
        let (wake_sender, wake_receiver) = bounded::<()>(0);
        let shutdown = Arc::new(AtomicBool::new(false));

        let heartbeat = {
            let heartbeat = service.heartbeat().clone();
            let interval = options.heartbeat_interval;
            let stop = wake_receiver.clone();
            thread::spawn(move || beat_until_closed(&heartbeat, interval, &stop))
        };

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let service = service.clone();
            let options = options.clone();
            let wake_rx = wake_receiver.clone();
            let shutdown_flag = Arc::clone(&shutdown);

            let handle = thread::spawn(move || {
                run_worker(worker_id, service, options, wake_rx, shutdown_flag);
            });
            workers.push(handle);
        }

        info!(
            "Started {} workers (poll every {}ms)",
            worker_count,
            options.poll_interval.as_millis()
        );

        Self {
            workers,
            heartbeat,
            shutdown,
            wake: Mutex::new(Some(wake_sender)),
        }
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker loop...");
        self.shutdown.store(true, Ordering::Relaxed);
        // Disconnecting the channel interrupts every sleeping worker.
        match self.wake.lock() {
            Ok(mut wake) => drop(wake.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Joins every worker. Call `shutdown` first or this blocks forever.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        if self.heartbeat.join().is_err() {
            error!("Heartbeat thread panicked");
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    service: JobService,
    options: WorkerOptions,
    wake: Receiver<()>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        let stats = run_one_cycle(&service, &options.filter);
        if stats.finished() > 0 || stats.busy > 0 {
            info!(
                "Worker {} cycle: {} succeeded, {} failed, {} busy",
                worker_id, stats.succeeded, stats.failed, stats.busy
            );
        }

        match wake.recv_timeout(options.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} woken for shutdown", worker_id);
                break;
            }
        }
    }
}
