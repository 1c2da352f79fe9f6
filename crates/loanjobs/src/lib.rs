pub mod artifact;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod job;
pub mod lock;
pub mod runner;
pub mod sanitize;
pub mod service;
pub mod store;
pub mod worker;

pub use broadcast::{JobEvent, JobEventBroadcaster};
pub use config::{load_config, resolve_config, JobsConfig};
pub use error::{
    ConfigError, LoanJobsError, LockError, Result, RunnerError, StoreError, ValidationError,
};
pub use job::{EnqueueResponse, JobRecord, JobRequest, JobStatus, JobView};
pub use runner::{PipelineRunner, ProcessGroupRunner};
pub use service::{JobService, RecoveryReport, RunOneOutcome};
pub use store::{JobFilter, JobStore};
pub use worker::{run_one_cycle, Heartbeat, WorkerLoop, WorkerOptions};
