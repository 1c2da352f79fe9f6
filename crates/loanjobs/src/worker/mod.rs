//! Background execution: heartbeat and the polling worker loop.

pub mod heartbeat;
pub mod pool;

pub use heartbeat::{Heartbeat, HeartbeatRecord, HeartbeatStatus, HeartbeatThread};
pub use pool::{run_one_cycle, CycleStats, WorkerLoop, WorkerOptions};
