use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use log::{info, warn};
use loanjobs::broadcast::spawn_event_logger;
use loanjobs::worker::HeartbeatThread;
use loanjobs::{
    run_one_cycle, JobEventBroadcaster, JobFilter, JobsConfig, WorkerLoop, WorkerOptions,
};

use super::build_service;

#[derive(Debug, Default)]
pub struct WorkerArgs {
    pub once: bool,
    pub poll_interval_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub tenant_id: Option<String>,
    pub loan_id: Option<String>,
}

pub fn run(config: JobsConfig, args: WorkerArgs) -> Result<()> {
    let events = JobEventBroadcaster::default();
    // Runs until the last service clone, and with it the sender, is gone.
    if let Err(e) = spawn_event_logger(&events) {
        warn!("Job events will not be logged: {}", e);
    }
    let service = build_service(config).with_events(events);

    let report = service
        .recover_on_startup()
        .context("startup recovery failed")?;
    if !report.still_running.is_empty() {
        info!(
            "Watching {} jobs still running from a previous worker",
            report.still_running.len()
        );
    }

    let mut options = WorkerOptions::from_service(&service);
    if let Some(ms) = args.poll_interval_ms {
        options.poll_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency.max(1);
    }
    options.filter = JobFilter {
        tenant_id: args.tenant_id,
        loan_id: args.loan_id,
    };

    if args.once {
        let beater = HeartbeatThread::start(service.heartbeat().clone(), options.heartbeat_interval);
        let stats = run_one_cycle(&service, &options.filter);
        beater.stop();
        info!(
            "Cycle done: {} succeeded, {} failed, {} busy",
            stats.succeeded, stats.failed, stats.busy
        );
        return Ok(());
    }

    let worker = WorkerLoop::start(service, options);

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("failed to install signal handler")?;

    // Blocks until SIGINT/SIGTERM.
    let _ = stop_rx.recv();

    worker.shutdown();
    worker.wait();

    if !report.still_running.is_empty() {
        info!("Detached jobs keep running; the next worker start will pick them up");
    }
    Ok(())
}
