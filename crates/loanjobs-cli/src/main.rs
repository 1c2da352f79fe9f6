//! loanjobs - loan pipeline job queue.
//!
//! `worker` drains the queue; every other subcommand is a one-shot client
//! that reads or writes the shared job directory and exits.

mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use loanjobs::JobStatus;

use crate::logging::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "loanjobs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a JSON config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the shared base path
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Log filter directive, e.g. "info" or "loanjobs=debug"
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover interrupted jobs, then execute PENDING jobs until stopped
    Worker {
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,

        #[arg(long)]
        poll_interval_ms: Option<u64>,

        #[arg(long)]
        concurrency: Option<usize>,

        /// Only take jobs for this tenant
        #[arg(long)]
        tenant_id: Option<String>,

        /// Only take jobs for this loan
        #[arg(long)]
        loan_id: Option<String>,
    },

    /// Submit a job and print its id and status
    Enqueue {
        tenant_id: String,
        loan_id: String,

        /// Request body as inline JSON
        #[arg(long, conflicts_with = "request_file")]
        request: Option<String>,

        /// Request body read from a JSON file
        #[arg(long)]
        request_file: Option<PathBuf>,
    },

    /// Print one job
    Get { job_id: String },

    /// Print recent jobs, newest first
    List {
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Report worker liveness
    Heartbeat,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_format, &cli.log_level)?;

    let config = commands::load_config(cli.config.as_deref(), cli.base_path.as_deref())?;

    match cli.command {
        Command::Worker {
            once,
            poll_interval_ms,
            concurrency,
            tenant_id,
            loan_id,
        } => commands::worker::run(
            config,
            commands::worker::WorkerArgs {
                once,
                poll_interval_ms,
                concurrency,
                tenant_id,
                loan_id,
            },
        ),
        Command::Enqueue {
            tenant_id,
            loan_id,
            request,
            request_file,
        } => commands::jobs::enqueue(
            config,
            &tenant_id,
            &loan_id,
            request.as_deref(),
            request_file.as_deref(),
        ),
        Command::Get { job_id } => commands::jobs::get(config, &job_id),
        Command::List { limit, status } => commands::jobs::list(config, limit, status),
        Command::Heartbeat => commands::jobs::heartbeat(config),
    }
}
