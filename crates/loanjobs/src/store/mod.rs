pub mod atomic;
pub mod disk;

pub use atomic::{create_json_exclusive, read_json, write_json_atomic};
pub use disk::{IndexEntry, JobFilter, JobStore};
