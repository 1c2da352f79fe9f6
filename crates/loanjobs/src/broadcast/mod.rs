//! Live job event streaming for in-process subscribers.

pub mod job_events;

pub use job_events::{spawn_event_logger, JobEvent, JobEventBroadcaster, JobOutputForwarder};
