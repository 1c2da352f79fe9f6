//! Shared utilities for loanjobs integration tests.
//!
//! - `TestHarness` for an isolated base path with fast timeouts
//! - `ScriptedRunner` standing in for the external pipeline

pub mod harness;
pub mod runner;

pub use harness::*;
pub use runner::*;
